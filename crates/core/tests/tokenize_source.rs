//! Tokenizer behavior on whole scripts

use quill_core::{TokenKind, tokenize, tokenize_into};

#[test]
fn test_script_with_blocks() {
    let source = r#"
def greet(name, greeting='Hello')
    # comment lines vanish
    return greeting + ', ' + name
end

for i in [1, 2,
          3]
    print greet(Text(i))
end
"#;
    let buffer = tokenize(source);
    let range = buffer.range();
    let statements = range.split(";");
    // def, return, end, for, print, end, plus the trailing empty piece
    assert_eq!(statements.len(), 7);
    assert_eq!(statements[0].first_text(), "def");
    assert_eq!(statements[1].first_text(), "return");
    assert_eq!(statements[3].first_text(), "for");
    assert_eq!(statements[3].line(0), 7);
    assert_eq!(statements[4].line(0), 9);
    assert!(statements[6].is_empty());
}

#[test]
fn test_reuse_buffer_between_parses() {
    let mut buffer = tokenize("a = 1");
    let stale = buffer.tokens()[0];
    tokenize_into("long_identifier_name", &mut buffer);
    assert_eq!(buffer.text(&stale), None);
    assert_eq!(buffer.tokens()[0].kind(), TokenKind::Identifier);
    assert_eq!(buffer.text_at(0), "long_identifier_name");
}

#[test]
fn test_large_source_spans_many_pools() {
    let source: String = (0..2000).map(|i| format!("name_{} = {}\n", i, i)).collect();
    let buffer = tokenize(&source);
    assert!(buffer.pool_count() > 1);
    assert_eq!(buffer.len(), 2000 * 4);
    assert_eq!(buffer.text_at(4 * 1999), "name_1999");
    assert_eq!(buffer.tokens()[4 * 1999].line(), 2000);
}

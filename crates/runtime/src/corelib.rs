//! Built-in native modules: `Core`, `Version` and `Path`
//!
//! `Core` holds one subrecord per value type (`Text`, `Dictionary`,
//! `Array`). Calling a method on a value, e.g. `'a'.upper()`, looks the
//! method up in the subrecord named after the value's type.

use crate::arithmetic::join_path;
use crate::error::{Error, Result};
use crate::function::NativeEntry;
use crate::process::Context;
use crate::record::Record;
use crate::value::Value;
use std::rc::Rc;

fn native(f: impl Fn(&Context, &[Value]) -> Result<Option<Value>> + 'static) -> NativeEntry {
    Rc::new(f)
}

fn expect_args(method: &str, args: &[Value], count: usize) -> Result<()> {
    if args.len() != count {
        return Err(Error::WrongArguments(format!(
            "{}() takes {} argument{} ({} given)",
            method,
            count,
            if count == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

fn instance<'c>(context: &'c Context, method: &str) -> Result<&'c Value> {
    context
        .instance()
        .ok_or_else(|| Error::Illegal(format!("{}() needs an instance", method)))
}

fn instance_text(context: &Context, method: &str) -> Result<String> {
    match instance(context, method)? {
        Value::Text(text) => Ok(text.clone()),
        other => Err(Error::Type(format!(
            "{}() is a Text method, not {}",
            method,
            other.type_name()
        ))),
    }
}

/// Text method taking no arguments.
fn text_method(name: &'static str, apply: fn(&str) -> String) -> NativeEntry {
    native(move |context, args| {
        expect_args(name, args, 0)?;
        let text = instance_text(context, name)?;
        Ok(Some(Value::Text(apply(&text))))
    })
}

/// Text method taking one Text argument and answering True/False.
fn text_predicate(name: &'static str, test: fn(&str, &str) -> bool) -> NativeEntry {
    native(move |context, args| {
        expect_args(name, args, 1)?;
        let text = instance_text(context, name)?;
        Ok(Some(Value::boolean(test(&text, &args[0].as_text()))))
    })
}

/// Everything before the last `/`.
pub fn file_name_path(path: &str) -> &str {
    path.rfind('/').map_or("", |at| &path[..at])
}

pub fn file_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |at| &path[at + 1..])
}

/// Extension of the file name including the dot. A leading dot (hidden
/// file) does not start an extension.
pub fn file_name_extension(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(at) if at > 0 => &name[at..],
        _ => "",
    }
}

fn strip_extension(path: &str) -> &str {
    let extension = file_name_extension(path);
    &path[..path.len() - extension.len()]
}

fn text_class() -> Record {
    let mut class = Record::new();
    class.add_native("upper", text_method("upper", str::to_uppercase));
    class.add_native("lower", text_method("lower", str::to_lowercase));
    class.add_native(
        "beginsWith",
        text_predicate("beginsWith", |text, prefix| text.starts_with(prefix)),
    );
    class.add_native(
        "endsWith",
        text_predicate("endsWith", |text, suffix| text.ends_with(suffix)),
    );
    class.add_native(
        "fileNamePath",
        text_method("fileNamePath", |t| file_name_path(t).to_string()),
    );
    class.add_native(
        "fileNameExtension",
        text_method("fileNameExtension", |t| file_name_extension(t).to_string()),
    );
    class.add_native(
        "fileNameWithoutExtension",
        text_method("fileNameWithoutExtension", |t| {
            strip_extension(file_name(t)).to_string()
        }),
    );
    class.add_native(
        "fileNameAndPathWithoutExtension",
        text_method("fileNameAndPathWithoutExtension", |t| {
            strip_extension(t).to_string()
        }),
    );
    class
}

fn dictionary_class() -> Record {
    fn contents(method: &'static str, keys: bool) -> NativeEntry {
        native(move |context, args| {
            expect_args(method, args, 0)?;
            match instance(context, method)? {
                Value::Dictionary(dict) => Ok(Some(Value::Array(if keys {
                    dict.keys()
                } else {
                    dict.values()
                }))),
                other => Err(Error::Type(format!(
                    "{}() is a Dictionary method, not {}",
                    method,
                    other.type_name()
                ))),
            }
        })
    }
    let mut class = Record::new();
    class.add_native("keys", contents("keys", true));
    class.add_native("values", contents("values", false));
    class
}

fn array_class() -> Record {
    let mut class = Record::new();
    class.add_native(
        "contains",
        native(|context, args| {
            expect_args("contains", args, 1)?;
            match instance(context, "contains")? {
                Value::Array(items) => Ok(Some(Value::boolean(
                    items.iter().any(|item| item.equals(&args[0])),
                ))),
                other => Err(Error::Type(format!(
                    "contains() is an Array method, not {}",
                    other.type_name()
                ))),
            }
        }),
    );
    class
}

pub fn core_module() -> Record {
    let mut core = Record::new();
    core.add_subrecord("Text", text_class());
    core.add_subrecord("Dictionary", dictionary_class());
    core.add_subrecord("Array", array_class());
    core
}

/// Build and platform information. Every member is read-only.
pub fn version_module() -> Record {
    let mut module = Record::new();
    let version = env!("CARGO_PKG_VERSION");
    let parts = version
        .split('.')
        .filter_map(|part| part.parse::<f64>().ok())
        .map(Value::number)
        .collect();
    module.add_array("VERSION", parts).set_read_only();
    module.add_text("TEXT", version).set_read_only();
    module.add_text("OS", std::env::consts::OS).set_read_only();
    module
        .add_number("CPU_BITS", usize::BITS as f64)
        .set_read_only();
    module
        .add_boolean("DEBUG", cfg!(debug_assertions))
        .set_read_only();
    module
}

pub fn path_module() -> Record {
    let mut module = Record::new();
    module.add_native(
        "withoutFileName",
        native(|_, args| {
            expect_args("withoutFileName", args, 1)?;
            Ok(Some(Value::Text(file_name_path(&args[0].as_text()).to_string())))
        }),
    );
    module.add_native(
        "fileName",
        native(|_, args| {
            expect_args("fileName", args, 1)?;
            Ok(Some(Value::Text(file_name(&args[0].as_text()).to_string())))
        }),
    );
    module.add_native(
        "join",
        native(|_, args| {
            let mut path = String::new();
            for arg in args {
                path = join_path(&path, &arg.as_text());
            }
            Ok(Some(Value::Text(path)))
        }),
    );
    module
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_parts() {
        assert_eq!(file_name_path("/data/maps/e1m1.wad"), "/data/maps");
        assert_eq!(file_name_path("plain"), "");
        assert_eq!(file_name("/data/maps/e1m1.wad"), "e1m1.wad");
        assert_eq!(file_name_extension("/data/maps/e1m1.wad"), ".wad");
        assert_eq!(file_name_extension("/home/.profile"), "");
        assert_eq!(file_name_extension("archive.tar.gz"), ".gz");
        assert_eq!(strip_extension("/a/b.c/file.txt"), "/a/b.c/file");
        assert_eq!(strip_extension("/a/b.c/file"), "/a/b.c/file");
    }

    #[test]
    fn test_version_is_read_only() {
        let mut version = version_module();
        assert_eq!(version.value("TEXT").unwrap(), Value::from(env!("CARGO_PKG_VERSION")));
        let error = version.set("OS", Value::from("other")).unwrap_err();
        assert_eq!(error.name(), "ReadOnlyError");
    }

    #[test]
    fn test_core_classes() {
        let core = core_module();
        for class in ["Text", "Dictionary", "Array"] {
            assert!(core.has_subrecord(class), "missing {}", class);
        }
    }
}

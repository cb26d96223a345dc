//! Expression operators and their binding strength.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Or,
    And,
    Not,
    In,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

/// Weakest binding first. Member access, calls and indexing bind tighter
/// than anything listed here.
pub const PRECEDENCE: &[&[Operator]] = &[
    &[Operator::Or],
    &[Operator::And],
    &[Operator::Not],
    &[
        Operator::In,
        Operator::Equal,
        Operator::NotEqual,
        Operator::Less,
        Operator::Greater,
        Operator::LessOrEqual,
        Operator::GreaterOrEqual,
    ],
    &[Operator::Plus, Operator::Minus],
    &[Operator::Multiply, Operator::Divide, Operator::Modulo],
];

/// Binding level of prefix `-` and `+`.
pub const UNARY_SIGN_LEVEL: usize = 6;

impl Operator {
    pub fn from_text(text: &str) -> Option<Operator> {
        Some(match text {
            "or" => Operator::Or,
            "and" => Operator::And,
            "not" => Operator::Not,
            "in" => Operator::In,
            "==" => Operator::Equal,
            "!=" => Operator::NotEqual,
            "<" => Operator::Less,
            ">" => Operator::Greater,
            "<=" => Operator::LessOrEqual,
            ">=" => Operator::GreaterOrEqual,
            "+" => Operator::Plus,
            "-" => Operator::Minus,
            "*" => Operator::Multiply,
            "/" => Operator::Divide,
            "%" => Operator::Modulo,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Or => "or",
            Operator::And => "and",
            Operator::Not => "not",
            Operator::In => "in",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::Less => "<",
            Operator::Greater => ">",
            Operator::LessOrEqual => "<=",
            Operator::GreaterOrEqual => ">=",
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Multiply => "*",
            Operator::Divide => "/",
            Operator::Modulo => "%",
        }
    }

    /// Binding level when used between two operands.
    pub fn binary_level(self) -> Option<usize> {
        if self == Operator::Not {
            return None;
        }
        PRECEDENCE.iter().position(|level| level.contains(&self))
    }

    /// Binding level when used as a prefix.
    pub fn unary_level(self) -> Option<usize> {
        match self {
            Operator::Not => PRECEDENCE.iter().position(|level| level.contains(&self)),
            Operator::Minus | Operator::Plus => Some(UNARY_SIGN_LEVEL),
            _ => None,
        }
    }

    pub fn is_unary_capable(self) -> bool {
        self.unary_level().is_some()
    }

    pub fn serial_id(self) -> u8 {
        self as u8
    }

    pub fn from_serial_id(id: u8) -> Option<Operator> {
        const ALL: [Operator; 15] = [
            Operator::Or,
            Operator::And,
            Operator::Not,
            Operator::In,
            Operator::Equal,
            Operator::NotEqual,
            Operator::Less,
            Operator::Greater,
            Operator::LessOrEqual,
            Operator::GreaterOrEqual,
            Operator::Plus,
            Operator::Minus,
            Operator::Multiply,
            Operator::Divide,
            Operator::Modulo,
        ];
        ALL.get(id as usize).copied()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assignment forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    /// `?=`: assign only if the name does not exist yet.
    SetIfMissing,
}

impl AssignOp {
    pub fn from_text(text: &str) -> Option<AssignOp> {
        Some(match text {
            "=" => AssignOp::Set,
            "+=" => AssignOp::Add,
            "-=" => AssignOp::Subtract,
            "*=" => AssignOp::Multiply,
            "/=" => AssignOp::Divide,
            "%=" => AssignOp::Modulo,
            "?=" => AssignOp::SetIfMissing,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Subtract => "-=",
            AssignOp::Multiply => "*=",
            AssignOp::Divide => "/=",
            AssignOp::Modulo => "%=",
            AssignOp::SetIfMissing => "?=",
        }
    }

    /// Arithmetic operator applied by compound assignment.
    pub fn arithmetic(self) -> Option<Operator> {
        match self {
            AssignOp::Add => Some(Operator::Plus),
            AssignOp::Subtract => Some(Operator::Minus),
            AssignOp::Multiply => Some(Operator::Multiply),
            AssignOp::Divide => Some(Operator::Divide),
            AssignOp::Modulo => Some(Operator::Modulo),
            AssignOp::Set | AssignOp::SetIfMissing => None,
        }
    }

    pub fn serial_id(self) -> u8 {
        self as u8
    }

    pub fn from_serial_id(id: u8) -> Option<AssignOp> {
        const ALL: [AssignOp; 7] = [
            AssignOp::Set,
            AssignOp::Add,
            AssignOp::Subtract,
            AssignOp::Multiply,
            AssignOp::Divide,
            AssignOp::Modulo,
            AssignOp::SetIfMissing,
        ];
        ALL.get(id as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert!(Operator::Or.binary_level() < Operator::And.binary_level());
        assert!(Operator::Equal.binary_level() < Operator::Plus.binary_level());
        assert!(Operator::Plus.binary_level() < Operator::Multiply.binary_level());
        assert_eq!(Operator::Not.binary_level(), None);
        assert!(Operator::Minus.unary_level() > Operator::Modulo.binary_level());
        assert_eq!(Operator::Multiply.unary_level(), None);
    }

    #[test]
    fn test_serial_ids_are_stable() {
        for id in 0..15u8 {
            let op = Operator::from_serial_id(id).unwrap();
            assert_eq!(op.serial_id(), id);
            assert_eq!(Operator::from_text(op.as_str()), Some(op));
        }
        assert_eq!(Operator::from_serial_id(15), None);
        assert_eq!(AssignOp::from_serial_id(6), Some(AssignOp::SetIfMissing));
    }
}

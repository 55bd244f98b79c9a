//! Dependency expressions (DEPEX)
//!
//! A small postfix byte code over GUID operands, see PI specification volume 2,
//! "Dependency Expression Instruction Set". Rendered here as an infix string.

use strum::Display as StrDisplay;
use zerocopy::FromBytes;

use crate::guid::Guid;

#[derive(StrDisplay, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    #[strum(serialize = "BEFORE")]
    Before = 0x00,
    #[strum(serialize = "AFTER")]
    After = 0x01,
    #[strum(serialize = "PUSH")]
    Push = 0x02,
    #[strum(serialize = "AND")]
    And = 0x03,
    #[strum(serialize = "OR")]
    Or = 0x04,
    #[strum(serialize = "NOT")]
    Not = 0x05,
    #[strum(serialize = "TRUE")]
    True = 0x06,
    #[strum(serialize = "FALSE")]
    False = 0x07,
    #[strum(serialize = "END")]
    End = 0x08,
    #[strum(serialize = "SOR")]
    Sor = 0x09,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        Ok(match b {
            0x00 => Self::Before,
            0x01 => Self::After,
            0x02 => Self::Push,
            0x03 => Self::And,
            0x04 => Self::Or,
            0x05 => Self::Not,
            0x06 => Self::True,
            0x07 => Self::False,
            0x08 => Self::End,
            0x09 => Self::Sor,
            b => return Err(b),
        })
    }
}

const GUID_SIZE: usize = size_of::<Guid>();

/// Rendered expression plus whatever was wrong with the byte code.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expression {
    pub text: String,
    pub problems: Vec<String>,
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn operand(data: &[u8], pos: usize) -> Option<Guid> {
    let (g, _) = Guid::read_from_prefix(data.get(pos..)?).ok()?;
    Some(g)
}

pub fn parse(data: &[u8]) -> Expression {
    let mut problems = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut prefix = String::new();
    let mut pos = 0;
    let mut ended = false;

    if data.len() < 2 {
        problems.push(format!("expression of {} bytes is too short", data.len()));
    }

    while pos < data.len() {
        let op = match Opcode::try_from(data[pos]) {
            Ok(op) => op,
            Err(b) => {
                problems.push(format!(
                    "unknown opcode {b:02x} at {pos:04x}, remaining: {}",
                    hex_dump(&data[pos..])
                ));
                break;
            }
        };
        match op {
            Opcode::Before | Opcode::After => {
                if pos != 0 {
                    problems.push(format!("{op} at {pos:04x} is not the first opcode"));
                    break;
                }
                let Some(g) = operand(data, pos + 1) else {
                    problems.push(format!("{op} operand is truncated"));
                    break;
                };
                stack.push(format!("{op} {}", g.name()));
                pos += 1 + GUID_SIZE;
                if data.get(pos) != Some(&(Opcode::End as u8)) {
                    problems.push(format!("{op} must be followed by END"));
                    break;
                }
            }
            Opcode::Sor => {
                if pos != 0 {
                    problems.push(format!("SOR at {pos:04x} is not the first opcode"));
                    break;
                }
                prefix = "SOR ".to_string();
                pos += 1;
            }
            Opcode::Push => {
                let Some(g) = operand(data, pos + 1) else {
                    problems.push("PUSH operand is truncated".to_string());
                    break;
                };
                stack.push(g.name());
                pos += 1 + GUID_SIZE;
            }
            Opcode::And | Opcode::Or => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    problems.push(format!("{op} at {pos:04x} needs two operands"));
                    break;
                };
                stack.push(format!("({a} {op} {b})"));
                pos += 1;
            }
            Opcode::Not => {
                let Some(a) = stack.pop() else {
                    problems.push(format!("NOT at {pos:04x} needs an operand"));
                    break;
                };
                stack.push(format!("NOT {a}"));
                pos += 1;
            }
            Opcode::True | Opcode::False => {
                stack.push(op.to_string());
                pos += 1;
            }
            Opcode::End => {
                ended = true;
                pos += 1;
                if pos != data.len() {
                    problems.push(format!(
                        "{} bytes after END",
                        data.len() - pos
                    ));
                }
                break;
            }
        }
    }

    if !ended && problems.is_empty() {
        problems.push("expression has no END".to_string());
    }
    if ended && stack.len() != 1 {
        problems.push(format!("{} values left on the stack at END", stack.len()));
    }

    Expression {
        text: format!("{prefix}{}", stack.join(" ")),
        problems,
    }
}

#[cfg(test)]
fn push(code: &mut Vec<u8>, g: Guid) {
    code.push(Opcode::Push as u8);
    code.extend_from_slice(&g.to_bytes());
}

#[test]
fn infix_rendering() {
    let mut code = Vec::new();
    push(&mut code, crate::guid::FFS2);
    push(&mut code, crate::guid::FFS3);
    code.push(Opcode::And as u8);
    code.push(Opcode::Not as u8);
    code.push(Opcode::True as u8);
    code.push(Opcode::Or as u8);
    code.push(Opcode::End as u8);
    let e = parse(&code);
    assert_eq!(e.problems, Vec::<String>::new());
    assert_eq!(
        e.text,
        "(NOT (EfiFirmwareFileSystem2Guid AND EfiFirmwareFileSystem3Guid) OR TRUE)"
    );
}

#[test]
fn before_and_sor() {
    let mut code = vec![Opcode::Before as u8];
    code.extend_from_slice(&crate::guid::DXE_APRIORI.to_bytes());
    code.push(Opcode::End as u8);
    let e = parse(&code);
    assert!(e.problems.is_empty());
    assert_eq!(e.text, "BEFORE DxeAprioriFile");

    let code = [Opcode::Sor as u8, Opcode::True as u8, Opcode::End as u8];
    assert_eq!(parse(&code).text, "SOR TRUE");
}

#[test]
fn unknown_opcode_halts() {
    let code = [Opcode::True as u8, 0x42, 0x08];
    let e = parse(&code);
    assert_eq!(e.text, "TRUE");
    assert_eq!(e.problems.len(), 1);
    assert!(e.problems[0].contains("unknown opcode 42"));
    assert!(e.problems[0].contains("42 08"));
}

#[test]
fn malformed() {
    let e = parse(&[Opcode::And as u8, Opcode::End as u8]);
    assert_eq!(e.problems.len(), 1);
    let e = parse(&[Opcode::True as u8, Opcode::True as u8]);
    assert_eq!(e.problems, vec!["expression has no END".to_string()]);
    let e = parse(&[Opcode::True as u8, Opcode::True as u8, Opcode::End as u8]);
    assert_eq!(e.problems.len(), 1);
}

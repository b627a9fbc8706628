//! Arithmetic expression evaluator behind the `calculate` operation.
//!
//! Supports numbers, parentheses, binary `+ - * / ** mod` and prefix `+ - abs sin cos`.
//! `**` binds tighter than `* / mod`, which bind tighter than `+ -`; `**` is right associative.
//! Nesting is limited to [`MAX_DEPTH`] levels.
use thiserror::Error;

/// Deepest nesting of parentheses, prefix operators or operator chains that is accepted.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum ExpressionError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("expression nested deeper than 256 levels")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Op(String),
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if !(c.is_ascii_digit() || c == '.') {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let text = &input[start..end];
                let value = text
                    .parse()
                    .map_err(|_| ExpressionError::InvalidNumber(text.to_string()))?;
                tokens.push(Token::Number(value));
            }
            '*' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '*'))) {
                    chars.next();
                    tokens.push(Token::Op("**".to_string()));
                } else {
                    tokens.push(Token::Op("*".to_string()));
                }
            }
            '+' | '-' | '/' => {
                chars.next();
                tokens.push(Token::Op(c.to_string()));
            }
            c if c.is_alphabetic() => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !c.is_alphabetic() {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Op(word));
            }
            other => return Err(ExpressionError::UnexpectedToken(other.to_string())),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
}

impl BinaryOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "+" => Some(BinaryOp::Add),
            "-" => Some(BinaryOp::Sub),
            "*" => Some(BinaryOp::Mul),
            "/" => Some(BinaryOp::Div),
            "**" => Some(BinaryOp::Pow),
            "mod" => Some(BinaryOp::Mod),
            _ => None,
        }
    }

    fn priority(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 2,
            BinaryOp::Pow => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Plus,
    Minus,
    Abs,
    Sin,
    Cos,
}

impl UnaryOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "+" => Some(UnaryOp::Plus),
            "-" => Some(UnaryOp::Minus),
            "abs" => Some(UnaryOp::Abs),
            "sin" => Some(UnaryOp::Sin),
            "cos" => Some(UnaryOp::Cos),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Expression {
    Number(f64),
    Unary(UnaryOp, Box<Expression>),
    Binary(BinaryOp, Box<Expression>, Box<Expression>),
}

impl Expression {
    fn eval(&self) -> Result<f64, ExpressionError> {
        Ok(match self {
            Expression::Number(value) => *value,
            Expression::Unary(op, arg) => {
                let a = arg.eval()?;
                match op {
                    UnaryOp::Plus => a,
                    UnaryOp::Minus => -a,
                    UnaryOp::Abs => a.abs(),
                    UnaryOp::Sin => a.sin(),
                    UnaryOp::Cos => a.cos(),
                }
            }
            Expression::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval()?, rhs.eval()?);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Mod => {
                        let divisor = b as i64;
                        if divisor == 0 {
                            return Err(ExpressionError::ModuloByZero);
                        }
                        ((a as i64) % divisor) as f64
                    }
                }
            }
        })
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_binary(&self) -> Option<BinaryOp> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => BinaryOp::parse(op),
            _ => None,
        }
    }

    /// Returns the parsed expression and the height of its tree.
    fn parse_binary(&mut self, min_priority: u8) -> Result<(Expression, usize), ExpressionError> {
        let (mut lhs, mut height) = self.parse_simple()?;

        while let Some(op) = self.peek_binary() {
            let priority = op.priority();
            if priority < min_priority {
                break;
            }
            self.pos += 1;

            let next_min = if op == BinaryOp::Pow {
                priority
            } else {
                priority + 1
            };
            let (rhs, rhs_height) = self.nested(|parser| parser.parse_binary(next_min))?;
            height = height.max(rhs_height) + 1;
            if height > MAX_DEPTH {
                return Err(ExpressionError::TooDeep);
            }
            lhs = Expression::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok((lhs, height))
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ExpressionError>,
    ) -> Result<T, ExpressionError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExpressionError::TooDeep);
        }

        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn parse_simple(&mut self) -> Result<(Expression, usize), ExpressionError> {
        self.nested(Self::parse_operand)
    }

    fn parse_operand(&mut self) -> Result<(Expression, usize), ExpressionError> {
        match self.next().ok_or(ExpressionError::UnexpectedEnd)? {
            Token::Number(value) => Ok((Expression::Number(value), 1)),
            Token::Open => {
                let inner = self.parse_binary(1)?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(_) => Err(ExpressionError::UnexpectedToken("expected ')'".to_string())),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Token::Close => Err(ExpressionError::UnexpectedToken(")".to_string())),
            Token::Op(op) => match UnaryOp::parse(&op) {
                Some(unary) => {
                    let (arg, height) = self.parse_simple()?;
                    Ok((Expression::Unary(unary, Box::new(arg)), height + 1))
                }
                None => Err(ExpressionError::UnexpectedToken(op)),
            },
        }
    }
}

/// Parses and evaluates `input`.
pub fn evaluate(input: &str) -> Result<f64, ExpressionError> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
        depth: 0,
    };

    let (expression, _) = parser.parse_binary(1)?;
    if let Some(token) = parser.tokens.get(parser.pos) {
        return Err(ExpressionError::UnexpectedToken(format!("{token:?}")));
    }
    expression.eval()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_associativity() {
        let inputs = vec![
            ("2 + 3 * 4", 14.0),
            ("(2 + 3) * 4", 20.0),
            ("10 - 4 - 3", 3.0),
            ("2 ** 3 ** 2", 512.0),
            ("7 mod 3", 1.0),
            ("-3 + abs -5", 2.0),
            ("1.5 * 2", 3.0),
            ("cos 0", 1.0),
        ];

        for (input, expected) in inputs {
            assert_eq!(evaluate(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(evaluate("2 +"), Err(ExpressionError::UnexpectedEnd));
        assert_eq!(evaluate(""), Err(ExpressionError::UnexpectedEnd));
        assert!(matches!(
            evaluate("foo 1"),
            Err(ExpressionError::UnexpectedToken(_))
        ));
        assert!(matches!(
            evaluate("1 2"),
            Err(ExpressionError::UnexpectedToken(_))
        ));
        assert!(matches!(
            evaluate("1.2.3"),
            Err(ExpressionError::InvalidNumber(_))
        ));
        assert_eq!(evaluate("5 mod 0"), Err(ExpressionError::ModuloByZero));
    }

    #[test]
    fn nesting_is_bounded() {
        let too_deep = vec![
            format!("{}1", "-".repeat(60000)),
            format!("{}1{}", "(".repeat(300), ")".repeat(300)),
            format!("{}1", "1 + ".repeat(300)),
            format!("{}2", "2 ** ".repeat(300)),
        ];
        for input in too_deep {
            assert_eq!(evaluate(&input), Err(ExpressionError::TooDeep));
        }

        assert_eq!(evaluate(&format!("{}1", "-".repeat(100))), Ok(1.0));
        assert_eq!(
            evaluate(&format!("{}1{}", "(".repeat(100), ")".repeat(100))),
            Ok(1.0)
        );
    }
}

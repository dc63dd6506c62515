//! Boolean step conditions.
//!
//! Grammar: non-negative integer logical ids, binary `&` (AND) and `|` (OR),
//! parentheses, whitespace anywhere. AND binds tighter than OR and both are
//! left-associative.
//!
//! An expression is tokenized, converted to postfix with a shunting-yard pass
//! driven by [`priority`], and folded into a binary tree. The tree is built
//! once per step and evaluated against the touched vector on every touch.
//!
//! ```
//! use qsy_routine::ExpressionTree;
//!
//! let tree = ExpressionTree::parse("(0&1)|2", 3).expect("valid expression");
//! assert!(tree.evaluate(&[true, true, false]));
//! assert!(tree.evaluate(&[false, false, true]));
//! assert!(!tree.evaluate(&[true, false, false]));
//! ```

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ExpressionError;

/// Logical ids travel on the wire as 16-bit values.
const MAX_LOGICAL_ID: u64 = u16::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Id(usize),
    And,
    Or,
    Open,
    Close,
}

/// Operator priority table; the open parenthesis is lowest so that it is
/// never popped by an operator.
fn priority(token: Token) -> u8 {
    match token {
        Token::Open => 0,
        Token::Or => 1,
        Token::And => 2,
        Token::Id(_) | Token::Close => u8::MAX,
    }
}

fn tokenize(expression: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = expression.char_indices().peekable();

    while let Some((position, c)) = chars.next() {
        let token = match c {
            '&' => Token::And,
            '|' => Token::Or,
            '(' => Token::Open,
            ')' => Token::Close,
            c if c.is_whitespace() => continue,
            c if c.is_ascii_digit() => {
                let mut value = u64::from(c as u8 - b'0');
                while let Some(&(_, next)) = chars.peek() {
                    let Some(digit) = next.to_digit(10) else {
                        break;
                    };
                    chars.next();
                    value = value.saturating_mul(10).saturating_add(u64::from(digit));
                }
                if value > MAX_LOGICAL_ID {
                    return Err(ExpressionError::IdOutOfRange {
                        id: value,
                        node_count: MAX_LOGICAL_ID as usize + 1,
                    });
                }
                Token::Id(value as usize)
            }
            other => {
                return Err(ExpressionError::UnknownToken {
                    token: other.to_string(),
                    position,
                });
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

/// Shunting-yard conversion that also rejects misplaced operands and operators.
fn to_postfix(tokens: &[Token]) -> Result<Vec<Token>, ExpressionError> {
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }

    let mut output = Vec::with_capacity(tokens.len());
    let mut operators: Vec<Token> = Vec::new();
    let mut expect_operand = true;

    for &token in tokens {
        match token {
            Token::Id(_) => {
                if !expect_operand {
                    return Err(ExpressionError::MissingOperator);
                }
                output.push(token);
                expect_operand = false;
            }
            Token::Open => {
                if !expect_operand {
                    return Err(ExpressionError::MissingOperator);
                }
                operators.push(token);
            }
            Token::Close => {
                if expect_operand {
                    return Err(ExpressionError::MissingOperand);
                }
                loop {
                    match operators.pop() {
                        Some(Token::Open) => break,
                        Some(operator) => output.push(operator),
                        None => return Err(ExpressionError::UnbalancedParentheses),
                    }
                }
            }
            Token::And | Token::Or => {
                if expect_operand {
                    return Err(ExpressionError::MissingOperand);
                }
                while let Some(&top) = operators.last() {
                    if priority(top) < priority(token) {
                        break;
                    }
                    output.push(top);
                    operators.pop();
                }
                operators.push(token);
                expect_operand = true;
            }
        }
    }

    if expect_operand {
        return Err(ExpressionError::MissingOperand);
    }
    while let Some(operator) = operators.pop() {
        if operator == Token::Open {
            return Err(ExpressionError::UnbalancedParentheses);
        }
        output.push(operator);
    }

    Ok(output)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Leaf(usize),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn evaluate(&self, touched: &[bool]) -> bool {
        match self {
            Node::Leaf(id) => touched.get(*id).copied().unwrap_or(false),
            Node::And(left, right) => left.evaluate(touched) && right.evaluate(touched),
            Node::Or(left, right) => left.evaluate(touched) || right.evaluate(touched),
        }
    }

    fn collect_ids(&self, ids: &mut BTreeSet<usize>) {
        match self {
            Node::Leaf(id) => {
                ids.insert(*id);
            }
            Node::And(left, right) | Node::Or(left, right) => {
                left.collect_ids(ids);
                right.collect_ids(ids);
            }
        }
    }
}

fn build_tree(postfix: Vec<Token>) -> Result<Node, ExpressionError> {
    let mut stack: Vec<Node> = Vec::new();

    for token in postfix {
        let node = match token {
            Token::Id(id) => Node::Leaf(id),
            Token::And | Token::Or => {
                let right = stack.pop().ok_or(ExpressionError::MissingOperand)?;
                let left = stack.pop().ok_or(ExpressionError::MissingOperand)?;
                if token == Token::And {
                    Node::And(Box::new(left), Box::new(right))
                } else {
                    Node::Or(Box::new(left), Box::new(right))
                }
            }
            Token::Open | Token::Close => return Err(ExpressionError::UnbalancedParentheses),
        };
        stack.push(node);
    }

    let root = stack.pop().ok_or(ExpressionError::Empty)?;
    if !stack.is_empty() {
        return Err(ExpressionError::MissingOperator);
    }
    Ok(root)
}

/// A parsed step condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionTree {
    expression: String,
    root: Node,
}

impl ExpressionTree {
    /// Parse `expression` for a routine over `node_count` logical nodes.
    ///
    /// # Errors
    ///
    /// Any [`ExpressionError`]; ids must be `< node_count`.
    pub fn parse(expression: &str, node_count: usize) -> Result<Self, ExpressionError> {
        let tokens = tokenize(expression)?;
        for token in &tokens {
            if let Token::Id(id) = *token {
                if id >= node_count {
                    return Err(ExpressionError::IdOutOfRange {
                        id: id as u64,
                        node_count,
                    });
                }
            }
        }
        let root = build_tree(to_postfix(&tokens)?)?;
        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    /// Evaluate against the touched vector (index = logical id).
    ///
    /// Ids beyond the end of `touched` count as untouched.
    pub fn evaluate(&self, touched: &[bool]) -> bool {
        self.root.evaluate(touched)
    }

    /// Logical ids the tree references.
    pub fn ids(&self) -> BTreeSet<usize> {
        let mut ids = BTreeSet::new();
        self.root.collect_ids(&mut ids);
        ids
    }

    /// Source text.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for ExpressionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Logical ids mentioned in `expression`, without checking its structure.
///
/// Used to cross-check a step's expression against its node configurations.
///
/// # Errors
///
/// [`ExpressionError::UnknownToken`] or an id above the 16-bit range.
pub fn referenced_ids(expression: &str) -> Result<BTreeSet<usize>, ExpressionError> {
    Ok(tokenize(expression)?
        .into_iter()
        .filter_map(|token| match token {
            Token::Id(id) => Some(id),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str, touched: &[bool]) -> bool {
        ExpressionTree::parse(expression, touched.len())
            .expect("valid expression")
            .evaluate(touched)
    }

    #[test]
    fn test_and_requires_both() {
        assert!(!eval("0&1", &[false, false]));
        assert!(!eval("0&1", &[true, false]));
        assert!(!eval("0&1", &[false, true]));
        assert!(eval("0&1", &[true, true]));
    }

    #[test]
    fn test_or_requires_either() {
        assert!(!eval("0|1", &[false, false]));
        assert!(eval("0|1", &[true, false]));
        assert!(eval("0|1", &[false, true]));
        assert!(eval("0|1", &[true, true]));
    }

    #[test]
    fn test_parentheses_and_precedence() {
        assert!(eval("(0&1)|2", &[false, false, true]));
        assert!(eval("(0&1)|2", &[true, true, false]));
        assert!(!eval("(0&1)|2", &[true, false, false]));

        // AND binds tighter: 0|1&2 == 0|(1&2)
        assert!(eval("0|1&2", &[true, false, false]));
        assert!(!eval("0|1&2", &[false, true, false]));
        assert!(!eval("(0|1)&2", &[true, false, false]));
        assert!(eval("(0|1)&2", &[true, false, true]));
    }

    #[test]
    fn test_whitespace_and_multi_digit_ids() {
        let mut touched = vec![false; 12];
        touched[10] = true;
        touched[11] = true;
        assert!(eval(" ( 10 & 11 ) | 0 ", &touched));
    }

    #[test]
    fn test_single_leaf() {
        assert!(eval("0", &[true]));
        assert!(!eval("((0))", &[false]));
    }

    #[test]
    fn test_malformed_expressions() {
        let cases: [(&str, ExpressionError); 9] = [
            ("", ExpressionError::Empty),
            ("  ", ExpressionError::Empty),
            ("0&", ExpressionError::MissingOperand),
            ("|1", ExpressionError::MissingOperand),
            ("()", ExpressionError::MissingOperand),
            ("(0&1", ExpressionError::UnbalancedParentheses),
            ("0&1)", ExpressionError::UnbalancedParentheses),
            ("0 1", ExpressionError::MissingOperator),
            ("0(1)", ExpressionError::MissingOperator),
        ];
        for (expression, expected) in cases {
            assert_eq!(
                ExpressionTree::parse(expression, 4),
                Err(expected),
                "expression {:?}",
                expression
            );
        }
    }

    #[test]
    fn test_unknown_token() {
        assert_eq!(
            ExpressionTree::parse("0 + 1", 2),
            Err(ExpressionError::UnknownToken {
                token: "+".to_string(),
                position: 2
            })
        );
    }

    #[test]
    fn test_id_out_of_range() {
        assert_eq!(
            ExpressionTree::parse("0|2", 2),
            Err(ExpressionError::IdOutOfRange {
                id: 2,
                node_count: 2
            })
        );
        assert!(matches!(
            ExpressionTree::parse("70000", 10),
            Err(ExpressionError::IdOutOfRange { id: 70_000, .. })
        ));
    }

    #[test]
    fn test_referenced_ids() {
        let ids = referenced_ids("(3&1)|3|0").expect("ids");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![0, 1, 3]);

        let tree = ExpressionTree::parse("(3&1)|3|0", 4).expect("tree");
        assert_eq!(tree.ids(), referenced_ids("(3&1)|3|0").expect("ids"));
        assert_eq!(tree.to_string(), "(3&1)|3|0");
    }
}

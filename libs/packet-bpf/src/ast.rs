//! Filter expression tree and the special/normal rewrite.

use bitflags::bitflags;

use crate::Error;

bitflags! {
    /// Fields named by a `valid ...` term.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValidTerms: u32 {
        const ETH_FCS = 0x01;
        const CHKSUM = 0x02;
        const PRBS = 0x04;
    }
}

/// Inclusive stream-id range of a `signature streamid` term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamIdRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            BinaryOp::And => BinaryOp::Or,
            BinaryOp::Or => BinaryOp::And,
        }
    }
}

/// A parsed filter expression.
///
/// `Generic` leaves hold byte-predicate text in libpcap syntax; `Valid`
/// and `Signature` leaves are the metadata ("special") extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Generic(String),
    Valid(ValidTerms),
    Signature(Option<StreamIdRange>),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn is_special(&self) -> bool {
        matches!(self, Expr::Valid(_) | Expr::Signature(_))
    }

    pub fn has_special(&self) -> bool {
        match self {
            Expr::Generic(_) => false,
            Expr::Valid(_) | Expr::Signature(_) => true,
            Expr::Not(inner) => inner.has_special(),
            Expr::Binary { lhs, rhs, .. } => lhs.has_special() || rhs.has_special(),
        }
    }

    pub fn has_all_special(&self) -> bool {
        match self {
            Expr::Generic(_) => false,
            Expr::Valid(_) | Expr::Signature(_) => true,
            Expr::Not(inner) => inner.has_all_special(),
            Expr::Binary { lhs, rhs, .. } => lhs.has_all_special() && rhs.has_all_special(),
        }
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op: BinaryOp::And,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op: BinaryOp::Or,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn not(inner: Expr) -> Expr {
        Expr::Not(Box::new(inner))
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Generic(text) => write!(f, "({text})"),
            Expr::Valid(terms) => {
                let mut parts = Vec::new();
                if terms.contains(ValidTerms::ETH_FCS) {
                    parts.push("fcs");
                }
                if terms.contains(ValidTerms::CHKSUM) {
                    parts.push("chksum");
                }
                if terms.contains(ValidTerms::PRBS) {
                    parts.push("prbs");
                }
                write!(f, "(valid {})", parts.join(" "))
            }
            Expr::Signature(None) => write!(f, "(signature)"),
            Expr::Signature(Some(range)) => {
                if range.start == range.end {
                    write!(f, "(signature streamid {})", range.start)
                } else {
                    write!(f, "(signature streamid {}-{})", range.start, range.end)
                }
            }
            Expr::Not(inner) => {
                let text = inner.to_string();
                if text.starts_with('(') {
                    write!(f, "not{text}")
                } else {
                    write!(f, "not({text})")
                }
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

fn remove_double_not(expr: Expr) -> Expr {
    match expr {
        Expr::Not(inner) => match *inner {
            Expr::Not(grandchild) => remove_double_not(*grandchild),
            other => Expr::not(remove_double_not(other)),
        },
        Expr::Binary { op, lhs, rhs } => Expr::Binary {
            op,
            lhs: Box::new(remove_double_not(*lhs)),
            rhs: Box::new(remove_double_not(*rhs)),
        },
        other => other,
    }
}

/// A binary node is buildable when neither child mixes special and
/// normal terms and a NOT child is pure one way or the other.
fn is_special_ok(expr: &Expr) -> bool {
    match expr {
        Expr::Binary { lhs, rhs, .. } => {
            let lhs_has_special = lhs.has_special();
            let rhs_has_special = rhs.has_special();

            if !lhs_has_special && !rhs_has_special {
                return true;
            }
            if !lhs.has_all_special() {
                return false;
            }
            if !rhs_has_special {
                return true;
            }
            rhs.has_all_special()
        }
        Expr::Not(inner) => !(inner.has_special() && !inner.has_all_special()),
        _ => true,
    }
}

/// Normalizes an expression so every binary node has all-special terms
/// on the left or all-normal terms on the right.
///
/// Double NOTs are eliminated first, NOT is pushed through binary nodes
/// via De Morgan, and same-operator chains are reassociated. Fails when
/// mixed AND/OR prevents grouping the special terms together.
pub fn split_special(expr: Expr) -> Result<Expr, Error> {
    let expr = remove_double_not(expr);

    if is_special_ok(&expr) {
        return Ok(expr);
    }

    match expr {
        Expr::Not(inner) => match *inner {
            Expr::Binary { op, lhs, rhs } => {
                // De Morgan: move the NOT into the binary expression.
                let rewritten = Expr::Binary {
                    op: op.toggled(),
                    lhs: Box::new(Expr::not(*lhs)),
                    rhs: Box::new(Expr::not(*rhs)),
                };
                split_special(rewritten)
            }
            _ => Err(Error::Split),
        },
        Expr::Binary { op, lhs, rhs } => {
            let (mut lhs, mut rhs) = (*lhs, *rhs);

            if rhs.has_special() && !lhs.has_special() {
                std::mem::swap(&mut lhs, &mut rhs);
            }

            if lhs.has_special() && !lhs.has_all_special() {
                // Push the lhs' normal terms into the rhs.
                lhs = split_special(lhs)?;
                if let Expr::Binary {
                    op: child_op,
                    lhs: child_lhs,
                    rhs: child_rhs,
                } = lhs
                {
                    if child_rhs.has_special() || op != child_op {
                        return Err(Error::Split);
                    }
                    rhs = Expr::Binary {
                        op,
                        lhs: child_rhs,
                        rhs: Box::new(rhs),
                    };
                    lhs = *child_lhs;
                }
            }

            if rhs.has_special() {
                // Pull the rhs' special terms into the lhs.
                rhs = split_special(rhs)?;
                if let Expr::Binary {
                    op: child_op,
                    lhs: child_lhs,
                    rhs: child_rhs,
                } = rhs
                {
                    if op != child_op {
                        return Err(Error::Split);
                    }
                    lhs = Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: child_lhs,
                    };
                    rhs = *child_rhs;
                }
            }

            Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        }
        other => Ok(other),
    }
}

//! Rule-based expression rewriting.
//!
//! A rule has a `pattern` template with `var(…)` wildcards, an optional
//! `where` condition (a conjunction of equalities over the bindings,
//! with `typeof`/`kindof` probes and pseudo-function evaluation), and a
//! `result` template instantiated under the final bindings. A residual
//! pattern variable in the instantiated result means the rule set
//! itself is malformed, which is a hard error rather than a diagnostic.

use std::rc::Rc;

use rdc_ir::{Bindings, Exp, ExpExt, Operator, SharedExp, Ty};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("pattern variable {0} remains in transformed result")]
    UnboundVar(String),
}

/// One rewrite rule.
#[derive(Debug, Clone)]
pub struct ExpRule {
    pub pattern: SharedExp,
    pub where_clause: Option<SharedExp>,
    pub result: SharedExp,
}

impl ExpRule {
    pub fn new(pattern: SharedExp, result: SharedExp) -> Self {
        ExpRule {
            pattern,
            where_clause: None,
            result,
        }
    }

    pub fn with_where(mut self, cond: SharedExp) -> Self {
        self.where_clause = Some(cond);
        self
    }
}

/// Applies one rule to expression roots.
pub struct GenericExpTransformer {
    rule: ExpRule,
}

impl GenericExpTransformer {
    pub fn new(rule: ExpRule) -> Self {
        GenericExpTransformer { rule }
    }

    /// Try the rule at the root of `e`. Returns the rewritten
    /// expression and whether the rule fired.
    pub fn apply_to(&self, e: &SharedExp) -> Result<(SharedExp, bool), TransformError> {
        let Some(mut bindings) = e.matches(&self.rule.pattern) else {
            return Ok((Rc::clone(e), false));
        };

        if let Some(cond) = &self.rule.where_clause {
            if !check_cond(cond, &mut bindings) {
                return Ok((Rc::clone(e), false));
            }
        }

        log::trace!("rule fired: {} => {} on {}", self.rule.pattern, self.rule.result, e);

        let instantiated = self.rule.result.apply_bindings(&bindings);
        let out = match apply_funcs(&instantiated) {
            Some(evaluated) => evaluated.simplify().0,
            None => return Ok((Rc::clone(e), false)),
        };

        let var_pattern = Exp::unary(Operator::Var, Exp::wild());
        if let Some(residual) = out.search(&var_pattern) {
            return Err(TransformError::UnboundVar(residual.to_string()));
        }
        Ok((out, true))
    }

    /// Apply the rule at every position in `e`, outermost first.
    pub fn apply_all(&self, e: &SharedExp) -> Result<(SharedExp, bool), TransformError> {
        let (rewritten, fired) = self.apply_to(e)?;
        if fired {
            return Ok((rewritten, true));
        }
        let mut changed = false;
        let mut error = None;
        let out = e.map_children(|c| match self.apply_all(c) {
            Ok((new_c, ch)) => {
                changed |= ch;
                new_c
            }
            Err(err) => {
                error = Some(err);
                Rc::clone(c)
            }
        });
        match error {
            Some(err) => Err(err),
            None => Ok((out, changed)),
        }
    }
}

/// Evaluate one conjunct of a `where` clause under the bindings,
/// extending them when a free variable appears on the left.
fn check_cond(cond: &SharedExp, bindings: &mut Bindings) -> bool {
    match &**cond {
        Exp::Binary {
            op: Operator::And,
            lhs,
            rhs,
        } => check_cond(lhs, bindings) && check_cond(rhs, bindings),

        Exp::Binary {
            op: Operator::Equals,
            lhs,
            rhs,
        } => {
            let mut lhs = lhs.apply_bindings(bindings);
            let rhs = rhs.apply_bindings(bindings);

            if lhs.op() == Operator::TypeOf {
                match eval_typeof(&lhs) {
                    Some(tv) => lhs = tv,
                    None => {
                        log::debug!("no type for {lhs}; rule does not apply");
                        return false;
                    }
                }
            }

            if let Exp::Unary {
                op: Operator::KindOf,
                sub,
            } = &*lhs
            {
                lhs = Exp::str_const(sub.op().name());
            }

            let Some(rhs) = apply_funcs(&rhs) else {
                return false;
            };

            // a still-free left variable binds to the right side
            if lhs.is_var() {
                bindings.push((lhs, rhs));
                return true;
            }

            if lhs == rhs {
                return true;
            }

            // the sides may unify, extending the bindings
            match rhs.matches(&lhs) {
                Some(extra) => {
                    bindings.extend(extra);
                    true
                }
                None => false,
            }
        }

        _ => {
            log::debug!("unsupported operator {} in where clause", cond.op().name());
            false
        }
    }
}

/// `typeof(e)` for expressions whose type is intrinsic.
fn eval_typeof(probe: &SharedExp) -> Option<SharedExp> {
    let Exp::Unary {
        op: Operator::TypeOf,
        sub,
    } = &**probe
    else {
        return None;
    };
    match &**sub {
        Exp::TypeVal(ty) => Some(Exp::typeval(ty.clone())),
        Exp::Const(rdc_ir::Const::Int(_)) => Some(Exp::typeval(Ty::int(0))),
        Exp::Const(rdc_ir::Const::Flt(_)) => Some(Exp::typeval(Ty::Float { width: 0 })),
        Exp::Terminal(Operator::True) | Exp::Terminal(Operator::False) => {
            Some(Exp::typeval(Ty::Bool))
        }
        _ => None,
    }
}

/// Evaluate the pseudo-functions over constant or type-valued
/// arguments. `None` means an application could not be evaluated and
/// the enclosing rule must fail rather than emit a half-rewritten
/// expression.
fn apply_funcs(e: &SharedExp) -> Option<SharedExp> {
    let mut failed = false;
    let rebuilt = e.map_children(|c| match apply_funcs(c) {
        Some(out) => out,
        None => {
            failed = true;
            Rc::clone(c)
        }
    });
    if failed {
        return None;
    }

    let Some((name, args)) = rebuilt.as_flag_call() else {
        return Some(rebuilt);
    };
    let items = args.list_items();

    match name.as_str() {
        "plus" => {
            let (a, b) = (items.first()?.int_value()?, items.get(1)?.int_value()?);
            Some(Exp::int(a.wrapping_add(b)))
        }
        "neg" => {
            let a = items.first()?.int_value()?;
            Some(Exp::int(a.wrapping_neg()))
        }
        // These need a compound type value to look into; the type
        // lattice here carries none, so the rule fails cleanly instead
        // of dereferencing a type that was never supplied.
        "memberAtOffset" | "offsetToMember" => {
            log::debug!("cannot evaluate {name} without a compound type value");
            None
        }
        _ => Some(rebuilt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_with_typeof_where_evaluates_pseudo_function() {
        // match a + b, where typeof(a) = int, become plus(a, b)
        let rule = ExpRule::new(
            Exp::binary(Operator::Plus, Exp::var("a"), Exp::var("b")),
            Exp::flag_call("plus", [Exp::var("a"), Exp::var("b")]),
        )
        .with_where(Exp::binary(
            Operator::Equals,
            Exp::unary(Operator::TypeOf, Exp::var("a")),
            Exp::typeval(Ty::int(0)),
        ));
        let tr = GenericExpTransformer::new(rule);

        let e = Exp::binary(Operator::Plus, Exp::int(3), Exp::int(4));
        let (out, fired) = tr.apply_to(&e).unwrap();
        assert!(fired);
        assert_eq!(out.int_value(), Some(7));
    }

    #[test]
    fn where_failure_leaves_expression_alone() {
        let rule = ExpRule::new(
            Exp::binary(Operator::Plus, Exp::var("a"), Exp::var("b")),
            Exp::flag_call("plus", [Exp::var("a"), Exp::var("b")]),
        )
        .with_where(Exp::binary(
            Operator::Equals,
            Exp::unary(Operator::TypeOf, Exp::var("a")),
            Exp::typeval(Ty::Float { width: 64 }),
        ));
        let tr = GenericExpTransformer::new(rule);

        let e = Exp::binary(Operator::Plus, Exp::int(3), Exp::int(4));
        let (out, fired) = tr.apply_to(&e).unwrap();
        assert!(!fired);
        assert_eq!(out, e);
    }

    #[test]
    fn residual_variable_is_a_hard_error() {
        // become references a variable the pattern never binds
        let rule = ExpRule::new(
            Exp::binary(Operator::Plus, Exp::var("a"), Exp::var("b")),
            Exp::var("c"),
        );
        let tr = GenericExpTransformer::new(rule);

        let e = Exp::binary(Operator::Plus, Exp::int(1), Exp::int(2));
        assert!(matches!(
            tr.apply_to(&e),
            Err(TransformError::UnboundVar(_))
        ));
    }

    #[test]
    fn free_lhs_variable_in_where_extends_bindings() {
        // match a + 0, where c = neg(a), become c
        let rule = ExpRule::new(
            Exp::binary(Operator::Plus, Exp::var("a"), Exp::int(0)),
            Exp::var("c"),
        )
        .with_where(Exp::binary(
            Operator::Equals,
            Exp::var("c"),
            Exp::flag_call("neg", [Exp::var("a")]),
        ));
        let tr = GenericExpTransformer::new(rule);

        let e = Exp::binary(Operator::Plus, Exp::int(5), Exp::int(0));
        let (out, fired) = tr.apply_to(&e).unwrap();
        assert!(fired);
        assert_eq!(out.int_value(), Some(-5));
    }

    #[test]
    fn member_at_offset_without_type_fails_the_rule() {
        let rule = ExpRule::new(
            Exp::var("a"),
            Exp::flag_call("memberAtOffset", [Exp::var("a"), Exp::int(8)]),
        );
        let tr = GenericExpTransformer::new(rule);

        let e = Exp::int(1);
        let (out, fired) = tr.apply_to(&e).unwrap();
        assert!(!fired);
        assert_eq!(out, e);
    }
}

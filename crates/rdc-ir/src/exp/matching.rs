//! Pattern search, replacement and unification over expression trees.
//!
//! Two matching disciplines coexist:
//!
//! * wildcard matching (`WILD`, `WILDINT`, `WILDSTR` leaves in the
//!   pattern match arbitrary subtrees of the right shape), used by
//!   `search`/`search_replace`;
//! * unification against a template containing `var(name)` leaves,
//!   which produces an ordered binding list, used by the generic
//!   transformer and by `where` clause evaluation.

use std::rc::Rc;

use super::{Const, Exp, ExpExt, Operator, SharedExp};

/// Ordered association list from `var(…)` subtrees to the subtrees they
/// matched. Later bindings never shadow earlier ones; a repeated
/// variable must match structurally equal subtrees.
pub type Bindings = Vec<(SharedExp, SharedExp)>;

/// Does `e` match `pattern` at the root, under wildcard rules?
fn matches_wild(e: &Exp, pattern: &Exp) -> bool {
    match pattern.op() {
        Operator::Wild => return true,
        Operator::WildIntConst => return e.is_int_const(),
        Operator::WildStrConst => return matches!(e, Exp::Const(Const::Str(_))),
        _ => {}
    }

    match (e, pattern) {
        (Exp::Const(a), Exp::Const(b)) => a == b,
        (Exp::Terminal(a), Exp::Terminal(b)) => a == b,
        (Exp::TypeVal(a), Exp::TypeVal(b)) => a == b,
        (Exp::Subscript { base: a, def: d1 }, Exp::Subscript { base: b, def: d2 }) => {
            d1 == d2 && matches_wild(a, b)
        }
        _ => {
            e.op() == pattern.op()
                && e.arity() == pattern.arity()
                && e.children()
                    .zip(pattern.children())
                    .all(|(c, p)| matches_wild(c, p))
        }
    }
}

pub(super) fn search(root: &SharedExp, pattern: &SharedExp) -> Option<SharedExp> {
    if matches_wild(root, pattern) {
        return Some(Rc::clone(root));
    }
    root.children().find_map(|c| search(c, pattern))
}

pub(super) fn search_all(root: &SharedExp, pattern: &SharedExp) -> Vec<SharedExp> {
    let mut found = Vec::new();
    search_all_into(root, pattern, &mut found);
    found
}

fn search_all_into(root: &SharedExp, pattern: &SharedExp, found: &mut Vec<SharedExp>) {
    if matches_wild(root, pattern) {
        found.push(Rc::clone(root));
        return;
    }
    for c in root.children() {
        search_all_into(c, pattern, found);
    }
}

pub(super) fn search_replace(
    root: &SharedExp,
    pattern: &SharedExp,
    replacement: &SharedExp,
) -> (SharedExp, bool) {
    let mut done = false;
    let result = replace_walk(root, pattern, replacement, true, &mut done);
    (result, done)
}

pub(super) fn search_replace_all(
    root: &SharedExp,
    pattern: &SharedExp,
    replacement: &SharedExp,
) -> (SharedExp, bool) {
    let mut changed = false;
    let result = replace_walk(root, pattern, replacement, false, &mut changed);
    (result, changed)
}

/// Pre-order replacement walk; with `first_only`, rewriting halts after
/// one match. Replacements are never re-entered either way.
fn replace_walk(
    root: &SharedExp,
    pattern: &SharedExp,
    replacement: &SharedExp,
    first_only: bool,
    changed: &mut bool,
) -> SharedExp {
    if first_only && *changed {
        return Rc::clone(root);
    }
    if matches_wild(root, pattern) {
        *changed = true;
        return Rc::clone(replacement);
    }
    root.map_children(|c| {
        if first_only && *changed {
            Rc::clone(c)
        } else {
            replace_walk(c, pattern, replacement, first_only, changed)
        }
    })
}

pub(super) fn unify(e: &SharedExp, template: &SharedExp) -> Option<Bindings> {
    let mut bindings = Bindings::new();
    if unify_into(e, template, &mut bindings) {
        Some(bindings)
    } else {
        None
    }
}

fn unify_into(e: &SharedExp, template: &SharedExp, bindings: &mut Bindings) -> bool {
    if template.is_var() {
        // A repeated variable must match an equal subtree.
        if let Some((_, bound)) = bindings.iter().find(|(v, _)| v == template) {
            return **bound == **e;
        }
        bindings.push((Rc::clone(template), Rc::clone(e)));
        return true;
    }

    if template.is_wild() {
        return true;
    }

    match (&**e, &**template) {
        (Exp::Const(a), Exp::Const(b)) => a == b,
        (Exp::Terminal(a), Exp::Terminal(b)) => a == b,
        (Exp::TypeVal(a), Exp::TypeVal(b)) => a == b,
        (Exp::Subscript { base, def }, Exp::Subscript { base: tb, def: td }) => {
            def == td && unify_into(base, tb, bindings)
        }
        _ => {
            e.op() == template.op()
                && e.arity() == template.arity()
                && e.children()
                    .zip(template.children())
                    .all(|(c, t)| unify_into(c, t, bindings))
        }
    }
}

pub(super) fn apply_bindings(e: &SharedExp, bindings: &Bindings) -> SharedExp {
    let mut result = Rc::clone(e);
    for (var, bound) in bindings {
        let (next, _) = search_replace_all(&result, var, bound);
        result = next;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exp::SsaDef;

    fn sample() -> SharedExp {
        // m[r28 + 4] + (r24 * 2)
        Exp::binary(
            Operator::Plus,
            Exp::mem_of(Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4))),
            Exp::binary(Operator::Mult, Exp::reg(24), Exp::int(2)),
        )
    }

    #[test]
    fn search_finds_first_preorder() {
        let e = sample();
        let pat = Exp::mem_of(Exp::wild());
        let hit = e.search(&pat).expect("memof present");
        assert!(hit.is_mem_of());

        assert!(e.search(&Exp::reg(29)).is_none());
    }

    #[test]
    fn search_all_is_nonoverlapping() {
        // m[m[r28]] with pattern m[WILD]: only the outer m[] reported
        let e = Exp::mem_of(Exp::mem_of(Exp::reg(28)));
        let hits = e.search_all(&Exp::mem_of(Exp::wild()));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], e);
    }

    #[test]
    fn wild_int_const() {
        let e = sample();
        let hits = e.search_all(&Exp::terminal(Operator::WildIntConst));
        // 4 and 2, plus the register-number constants inside r28 / r24
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn replace_first_only() {
        let e = Exp::binary(Operator::Plus, Exp::reg(24), Exp::reg(24));
        let (out, changed) = e.search_replace(&Exp::reg(24), &Exp::reg(25));
        assert!(changed);
        assert_eq!(out.to_string(), "(r25 + r24)");
    }

    #[test]
    fn replace_all_no_reentry() {
        // r24 -> m[r24] must not recurse into the freshly built m[r24]
        let e = Exp::binary(Operator::Plus, Exp::reg(24), Exp::reg(24));
        let (out, changed) = e.search_replace_all(&Exp::reg(24), &Exp::mem_of(Exp::reg(24)));
        assert!(changed);
        assert_eq!(out.to_string(), "(m[r24] + m[r24])");
    }

    #[test]
    fn search_iff_replace_reports_change() {
        let e = sample();
        let pat = Exp::binary(Operator::Mult, Exp::wild(), Exp::wild());
        let found = e.search(&pat).is_some();
        let (_, changed) = e.search_replace(&pat, &pat);
        assert_eq!(found, changed);

        // replacing a literal with itself keeps the tree equal
        let literal = Exp::int(4);
        let (out, changed) = e.search_replace(&literal, &literal);
        assert!(changed);
        assert_eq!(out, e);
    }

    #[test]
    fn unification_binds_and_checks_consistency() {
        let template = Exp::binary(Operator::Plus, Exp::var("a"), Exp::var("a"));
        let yes = Exp::binary(Operator::Plus, Exp::reg(24), Exp::reg(24));
        let no = Exp::binary(Operator::Plus, Exp::reg(24), Exp::reg(25));

        let bindings = yes.matches(&template).expect("should unify");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].1, Exp::reg(24));

        assert!(no.matches(&template).is_none());
    }

    #[test]
    fn unification_respects_subscripts() {
        let a = Exp::subscript(Exp::reg(24), SsaDef::Implicit);
        let b = Exp::subscript(Exp::reg(24), SsaDef::Implicit);
        assert!(a.matches(&b).is_some());
    }

    #[test]
    fn apply_bindings_substitutes_in_order() {
        let template = Exp::binary(Operator::Plus, Exp::var("a"), Exp::var("b"));
        let bindings: Bindings =
            vec![(Exp::var("a"), Exp::int(3)), (Exp::var("b"), Exp::int(4))];
        let out = template.apply_bindings(&bindings);
        assert_eq!(out.to_string(), "(3 + 4)");
    }
}

//! Rewrites parsed expressions into patterns and lvalues.
//!
//! Patterns reuse expression syntax; after parsing, `patternize` rewrites
//! the tree: `_` becomes match-any, comma lists become choice patterns,
//! spreads become rest bindings, calls of bare names become tag patterns,
//! and composites are rewritten recursively. `patternize` is idempotent.
//!
//! Definition lvalues introduce bindings (identifiers declare); assignment
//! lvalues rebind existing storage (identifiers must resolve, members and
//! subscripts must be addressable). Both are rewrites of already-parsed
//! expressions, checked again during symbolization.

use crate::{
    ast::{Expr, ExprKind},
    diagnostics::{DiagResult, Diagnostic, ErrorKind},
};

/// Rewrites an expression into a pattern.
#[must_use]
pub fn patternize(e: Expr) -> Expr {
    let Expr { span, kind } = e;
    let kind = match kind {
        ExprKind::Ident {
            module: None,
            ref name,
            ..
        } if name == "_" => ExprKind::MatchAny,
        ExprKind::List(es) => ExprKind::Choice(es.into_iter().map(patternize).collect()),
        ExprKind::Choice(es) => ExprKind::Choice(es.into_iter().map(patternize).collect()),
        ExprKind::Spread(inner) => match inner.kind {
            ExprKind::Ident {
                module: None, name, ..
            } => ExprKind::MatchRest { name, sym: None },
            _ => {
                return Expr::new(span, ExprKind::Spread(inner));
            }
        },
        // `Tag(p)` and `Tag(p1, p2)` call shapes become tag patterns; the
        // compiler checks the callee really is a tag.
        ExprKind::Call { callee, args }
            if matches!(callee.kind, ExprKind::Ident { .. }) && args.iter().all(|a| !a.spread && a.name.is_none()) =>
        {
            let mut patterns: Vec<Expr> = args.into_iter().map(|a| patternize(a.value)).collect();
            let inner = if patterns.len() == 1 {
                let Some(only) = patterns.pop() else {
                    unreachable!("length checked above");
                };
                only
            } else {
                let n = patterns.len();
                Expr::new(
                    span,
                    ExprKind::Tuple {
                        items: patterns,
                        names: vec![None; n],
                        conds: std::iter::repeat_with(|| None).take(n).collect(),
                        required: vec![true; n],
                    },
                )
            };
            ExprKind::TagPattern {
                tag: callee,
                inner: Box::new(inner),
            }
        }
        ExprKind::TagPattern { tag, inner } => ExprKind::TagPattern {
            tag,
            inner: Box::new(patternize(*inner)),
        },
        ExprKind::Array { elems, conds } => ExprKind::Array {
            elems: elems.into_iter().map(patternize).collect(),
            conds,
        },
        ExprKind::Dict {
            keys,
            values,
            conds,
            dflt,
        } => ExprKind::Dict {
            keys,
            values: values.into_iter().map(patternize).collect(),
            conds,
            dflt,
        },
        ExprKind::Tuple {
            items,
            names,
            conds,
            required,
        } => ExprKind::Tuple {
            items: items.into_iter().map(patternize).collect(),
            names,
            conds,
            required,
        },
        ExprKind::View { f, pat } => ExprKind::View {
            f,
            pat: Box::new(patternize(*pat)),
        },
        ExprKind::NotNilView { f, pat } => ExprKind::NotNilView {
            f,
            pat: Box::new(patternize(*pat)),
        },
        // `p as x` binds the whole subject alongside the inner pattern.
        ExprKind::Cast { e, ty } => match ty.kind {
            ExprKind::Ident {
                module: None, name, ..
            } => ExprKind::Alias {
                pattern: Box::new(patternize(*e)),
                name,
                sym: None,
            },
            _ => ExprKind::Cast {
                e: Box::new(patternize(*e)),
                ty,
            },
        },
        ExprKind::Alias { pattern, name, sym } => ExprKind::Alias {
            pattern: Box::new(patternize(*pattern)),
            name,
            sym,
        },
        other => other,
    };
    Expr::new(span, kind)
}

fn err(e: &Expr, what: &str) -> Diagnostic {
    Diagnostic::new(ErrorKind::ParseError, e.span, format!("invalid {what}"))
}

/// Checks and rewrites a definition target: identifiers introduce bindings.
pub fn definition_lvalue(e: Expr) -> DiagResult<Expr> {
    let p = patternize(e);
    check_definition_lvalue(&p)?;
    Ok(p)
}

fn check_definition_lvalue(e: &Expr) -> DiagResult<()> {
    match &e.kind {
        ExprKind::Ident { .. }
        | ExprKind::MatchAny
        | ExprKind::MatchNotNil { .. }
        | ExprKind::MatchRest { .. }
        | ExprKind::ResourceBinding { .. } => Ok(()),
        ExprKind::Array { elems, .. } | ExprKind::Choice(elems) => {
            for el in elems {
                check_definition_lvalue(el)?;
            }
            Ok(())
        }
        ExprKind::Tuple { items, .. } => {
            for item in items {
                check_definition_lvalue(item)?;
            }
            Ok(())
        }
        ExprKind::Dict { values, .. } => {
            for v in values {
                check_definition_lvalue(v)?;
            }
            Ok(())
        }
        ExprKind::TagPattern { inner, .. } => check_definition_lvalue(inner),
        ExprKind::Alias { pattern, .. } => check_definition_lvalue(pattern),
        ExprKind::View { pat, .. } | ExprKind::NotNilView { pat, .. } => check_definition_lvalue(pat),
        ExprKind::Cast { e, .. } => check_definition_lvalue(e),
        _ => Err(err(e, "binding target")),
    }
}

/// Checks an assignment target: identifiers rebind existing storage, and
/// member/subscript targets must be addressable.
pub fn assignment_lvalue(e: Expr) -> DiagResult<Expr> {
    check_assignment_lvalue(&e)?;
    Ok(e)
}

fn check_assignment_lvalue(e: &Expr) -> DiagResult<()> {
    match &e.kind {
        ExprKind::Ident { .. } | ExprKind::MatchAny | ExprKind::Member { .. } | ExprKind::Subscript { .. } => Ok(()),
        ExprKind::Array { elems, .. } => {
            for el in elems {
                check_assignment_lvalue(el)?;
            }
            Ok(())
        }
        ExprKind::Tuple { items, .. } => {
            for item in items {
                check_assignment_lvalue(item)?;
            }
            Ok(())
        }
        ExprKind::Spread(inner) => check_assignment_lvalue(inner),
        ExprKind::MatchRest { .. } => Ok(()),
        // `Tag(x) = v` unwraps the tag and assigns through.
        ExprKind::Call { callee, args }
            if matches!(callee.kind, ExprKind::Ident { .. }) && args.len() == 1 && args[0].name.is_none() =>
        {
            check_assignment_lvalue(&args[0].value)
        }
        ExprKind::TagPattern { inner, .. } => check_assignment_lvalue(inner),
        _ => Err(err(e, "assignment target")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Span;

    fn ident(name: &str) -> Expr {
        Expr::new(
            Span::default(),
            ExprKind::Ident {
                module: None,
                name: name.to_string(),
                sym: None,
            },
        )
    }

    #[test]
    fn underscore_becomes_match_any() {
        let p = patternize(ident("_"));
        assert!(matches!(p.kind, ExprKind::MatchAny));
    }

    #[test]
    fn patternize_is_idempotent() {
        let list = Expr::new(Span::default(), ExprKind::List(vec![ident("_"), ident("x")]));
        let once = patternize(list);
        let twice = patternize(once.clone());
        assert_eq!(format!("{once:?}"), format!("{twice:?}"));
    }

    #[test]
    fn spread_ident_becomes_rest() {
        let spread = Expr::new(Span::default(), ExprKind::Spread(Box::new(ident("rest"))));
        let p = patternize(spread);
        assert!(matches!(p.kind, ExprKind::MatchRest { ref name, .. } if name == "rest"));
    }

    #[test]
    fn literal_is_invalid_definition_target() {
        let lit = Expr::new(Span::default(), ExprKind::Integer(3));
        assert!(definition_lvalue(lit).is_err());
    }
}

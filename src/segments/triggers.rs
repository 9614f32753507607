use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::visit_expressions;
use sqlparser::ast::BinaryOperator;
use sqlparser::ast::Expr;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

/// Statically extract the event names a segment's evaluator SQL compares
/// against, so event ingestion only reevaluates segments that could have
/// changed.
///
/// Collected forms: `events.name = 'v'`, `'v' = events.name`, and
/// `events.name IN ('a', 'b', ...)`, anywhere in the statement. Backticks
/// are stripped before parsing. A SQL text the parser cannot handle yields
/// the empty set: the segment still evaluates through the periodic and
/// user-update paths, it just won't be triggered by events.
pub fn extract_event_triggers(sql: &str) -> BTreeSet<String> {
    let normalized = sql.replace('`', "");
    let mut triggers = BTreeSet::new();
    let Ok(statements) = Parser::parse_sql(&MySqlDialect {}, &normalized) else {
        return triggers;
    };
    let _: ControlFlow<()> = visit_expressions(&statements, |expr| {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                if is_events_name(left) {
                    collect_string_literal(right, &mut triggers);
                } else if is_events_name(right) {
                    collect_string_literal(left, &mut triggers);
                }
            }
            Expr::InList { expr, list, .. } if is_events_name(expr) => {
                for item in list {
                    collect_string_literal(item, &mut triggers);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    });
    triggers
}

fn is_events_name(expr: &Expr) -> bool {
    match expr {
        Expr::CompoundIdentifier(parts) => {
            let parts: Vec<String> = parts.iter().map(|p| p.value.to_lowercase()).collect();
            parts.ends_with(&["events".to_string(), "name".to_string()])
        }
        _ => false,
    }
}

fn collect_string_literal(
    expr: &Expr,
    triggers: &mut BTreeSet<String>,
) {
    use sqlparser::ast::Value;
    if let Expr::Value(Value::SingleQuotedString(s) | Value::DoubleQuotedString(s)) = expr {
        triggers.insert(s.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::extract_event_triggers;

    fn set(names: &[&str]) -> std::collections::BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equality_both_orders() {
        let sql = "SELECT id FROM users u \
                   JOIN events e ON e.user_id = u.id \
                   WHERE events.name = 'purchase' OR 'refund' = events.name";
        assert_eq!(extract_event_triggers(sql), set(&["purchase", "refund"]));
    }

    #[test]
    fn in_list() {
        let sql =
            "SELECT user_id AS id FROM events WHERE events.name IN ('signup', 'login', 'purchase')";
        assert_eq!(
            extract_event_triggers(sql),
            set(&["signup", "login", "purchase"])
        );
    }

    #[test]
    fn backticks_are_stripped() {
        let sql = "SELECT `id` FROM `users` WHERE `events`.`name` = 'purchase'";
        assert_eq!(extract_event_triggers(sql), set(&["purchase"]));
    }

    #[test]
    fn nested_subquery() {
        let sql = "SELECT id FROM users WHERE id IN \
                   (SELECT user_id FROM events WHERE events.name = 'checkout')";
        assert_eq!(extract_event_triggers(sql), set(&["checkout"]));
    }

    #[test]
    fn unrelated_comparisons_are_ignored() {
        let sql = "SELECT id FROM users \
                   WHERE status = 'active' AND JSON_EXTRACT(attributes, '$.plan') = 'pro'";
        assert_eq!(extract_event_triggers(sql), set(&[]));
    }

    #[test]
    fn unparsable_sql_yields_empty_set() {
        assert_eq!(extract_event_triggers("SELEKT id FORM users"), set(&[]));
    }
}

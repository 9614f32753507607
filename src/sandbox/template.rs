/// Compile embedded-expression template text into a rhai script that
/// evaluates to the rendered string.
///
/// Two tag forms, EJS-style:
/// - `<%= expr %>` interpolates the expression's value;
/// - `<% stmt %>` splices raw statements, so tags may open and close blocks
///   around literal chunks (`<% if user.active { %>...<% } %>`).
///
/// Literal text becomes `__out += "...";` appends; the caller prepends the
/// preamble and binds template variables in the evaluation scope.
pub(super) fn compile(html: &str) -> Result<String, String> {
    let mut script = String::with_capacity(html.len() + 64);
    script.push_str("let __out = \"\";\n");

    let mut rest = html;
    while let Some(open) = rest.find("<%") {
        push_literal(&mut script, &rest[..open]);
        let tag = &rest[open + 2..];
        let close = tag
            .find("%>")
            .ok_or_else(|| "Unclosed template tag".to_string())?;
        match tag.strip_prefix('=') {
            Some(expr_and_rest) => {
                let expr = expr_and_rest[..close - 1].trim();
                if expr.is_empty() {
                    return Err("Empty template expression".to_string());
                }
                script.push_str("__out += (");
                script.push_str(expr);
                script.push_str(");\n");
            }
            None => {
                // raw statement fragment; no trailing `;` so block tags compose
                script.push_str(tag[..close].trim());
                script.push('\n');
            }
        }
        rest = &tag[close + 2..];
    }
    push_literal(&mut script, rest);

    script.push_str("__out\n");
    Ok(script)
}

fn push_literal(
    script: &mut String,
    literal: &str,
) {
    if literal.is_empty() {
        return;
    }
    script.push_str("__out += \"");
    for c in literal.chars() {
        match c {
            '"' => script.push_str("\\\""),
            '\\' => script.push_str("\\\\"),
            '\n' => script.push_str("\\n"),
            '\r' => script.push_str("\\r"),
            '\t' => script.push_str("\\t"),
            c => script.push(c),
        }
    }
    script.push_str("\";\n");
}

#[cfg(test)]
mod tests {
    use claims::assert_err;
    use claims::assert_ok;

    use super::compile;

    #[test]
    fn literal_only() {
        let script = compile("<p>Hi</p>").unwrap();
        assert!(script.contains(r#"__out += "<p>Hi</p>";"#));
    }

    #[test]
    fn interpolation_and_statements() {
        let script = compile("<% let n = user.name %><p>Hi <%= n %></p>").unwrap();
        assert!(script.contains("let n = user.name"));
        assert!(script.contains("__out += (n);"));
    }

    #[test]
    fn escapes_quotes_and_newlines() {
        let script = compile("a \"b\"\nc\\d").unwrap();
        assert!(script.contains(r#"__out += "a \"b\"\nc\\d";"#));
    }

    #[test]
    fn unclosed_tag() {
        assert_err!(compile("<p><%= user.name"));
        assert_ok!(compile("<p>100%></p>"));
    }
}

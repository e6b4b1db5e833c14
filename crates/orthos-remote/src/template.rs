//! Command templates for management hosts
//!
//! Console and provisioning commands are configured per deployment as
//! templates with `{name}` placeholders. Substituted values are shell-quoted.

/// Quote a value for POSIX `sh`
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '@'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Replace each `{key}` in `template` with the quoted value
///
/// Substitution is a single pass over the template, so braces inside a value
/// are never expanded. Unknown placeholders are left untouched.
#[must_use]
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let value = tail.find('}').and_then(|close| {
            let key = &tail[1..close];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (close, *value))
        });
        match value {
            Some((close, value)) => {
                out.push_str(&shell_quote(value));
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_values_stay_unquoted() {
        assert_eq!(shell_quote("node1.lab.example.com"), "node1.lab.example.com");
    }

    #[test]
    fn test_metacharacters_are_quoted() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("x;rm -rf /"), "'x;rm -rf /'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_render() {
        let cmd = render(
            "cobbler system edit --name={fqdn} --profile={choice}",
            &[("fqdn", "n1.example.com"), ("choice", "sles 16")],
        );
        assert_eq!(
            cmd,
            "cobbler system edit --name=n1.example.com --profile='sles 16'"
        );
    }

    #[test]
    fn test_values_are_not_expanded_again() {
        let cmd = render(
            "setup --name={fqdn} --profile={choice}",
            &[("fqdn", "{choice}.lab"), ("choice", "sles 16")],
        );
        assert_eq!(cmd, "setup --name='{choice}.lab' --profile='sles 16'");
    }

    #[test]
    fn test_unknown_and_unclosed_placeholders_stay() {
        assert_eq!(
            render("echo {other} {fqdn} {", &[("fqdn", "n1")]),
            "echo {other} n1 {"
        );
        assert_eq!(render("awk '{print $1}'", &[]), "awk '{print $1}'");
    }
}

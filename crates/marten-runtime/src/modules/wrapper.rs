//! CommonJS function wrapper.

/// Parameters the wrapper binds, in call order.
pub const WRAPPER_PARAMS: [&str; 6] = ["exports", "require", "module", "__filename", "__dirname", "process"];

/// Wrap a script body so evaluating it yields a function taking
/// `(exports, require, module, __filename, __dirname, process)`.
///
/// The body starts right after the opening brace and a leading `#!` line is
/// blanked, so line numbers match the file.
pub fn wrap(source: &str) -> String {
    let body = match source.strip_prefix("#!") {
        Some(rest) => match rest.find('\n') {
            Some(pos) => &rest[pos..],
            None => "",
        },
        None => source,
    };
    format!("(function ({}) {{{}\n}})", WRAPPER_PARAMS.join(", "), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap() {
        let wrapped = wrap("module.exports = 42;");
        assert_eq!(
            wrapped,
            "(function (exports, require, module, __filename, __dirname, process) {module.exports = 42;\n})"
        );
    }

    #[test]
    fn test_wrap_strips_shebang() {
        let wrapped = wrap("#!/usr/bin/env node\nexports.a = 1;");
        assert!(!wrapped.contains("#!"));
        assert!(wrapped.contains("exports.a = 1;"));
    }

    #[test]
    fn test_body_keeps_line_numbers() {
        let source = "const a = 1;\nconst b = 2;\nthrow new Error();";
        let wrapped = wrap(source);
        let line = |text: &str, needle: &str| text.lines().position(|l| l.contains(needle));
        assert_eq!(line(&wrapped, "throw"), line(source, "throw"));

        let with_shebang = wrap("#!/usr/bin/env node\nthrow new Error();");
        assert_eq!(line(&with_shebang, "throw"), Some(1));
    }
}

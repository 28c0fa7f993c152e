//! Recovers raw artifacts (SVG markup, source code, tables) from free-text
//! model responses. Everything here is a pure text transform.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:[A-Za-z0-9_+.-]*[ \t]*\r?\n)?").unwrap());

static PLT_SHOW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"plt\.show\(\s*\)[ \t]*;?").unwrap());

static MARKED_BASE64_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"BASE64_START\s*([A-Za-z0-9+/=\r\n]+?)\s*BASE64_END").unwrap());

/// Delimiters of an artifact inside a model response.
#[derive(Debug, Clone, Copy)]
pub enum Marker<'a> {
    /// Markup element, e.g. `<svg` .. `</svg>`. Matched case-insensitively.
    Tag { open: &'a str, close: &'a str },
    /// Fenced code block. An empty language list accepts any tag.
    Fence { languages: &'a [&'a str] },
}

pub const SVG: Marker<'static> = Marker::Tag {
    open: "<svg",
    close: "</svg>",
};

pub const PYTHON: Marker<'static> = Marker::Fence {
    languages: &["python", "py"],
};

/// Returns the first well-formed occurrence of the artifact, or `None` when
/// the text holds none.
pub fn extract(text: &str, marker: &Marker<'_>) -> Option<String> {
    match marker {
        Marker::Tag { open, close } => balanced_element(text, open, close),
        Marker::Fence { languages } => {
            let language = if languages.is_empty() {
                "[A-Za-z0-9_+.-]*".to_string()
            } else {
                let alternatives = languages
                    .iter()
                    .map(|lang| regex::escape(lang))
                    .collect::<Vec<_>>()
                    .join("|");
                format!("(?:{alternatives})?")
            };
            let pattern = format!(r"(?is)```[ \t]*{language}[ \t]*\r?\n(.*?)\r?\n?```");
            let regex = Regex::new(&pattern).ok()?;
            let body = regex.captures(text)?.get(1)?.as_str();
            if body.trim().is_empty() {
                None
            } else {
                Some(body.to_string())
            }
        }
    }
}

/// First element whose open and close tags balance, nested elements
/// included. Self-closing tags count as complete elements.
fn balanced_element(text: &str, open: &str, close: &str) -> Option<String> {
    let pattern = format!(
        r"(?i)(?P<close>{})|{}[\s>/]",
        regex::escape(close),
        regex::escape(open)
    );
    let tokens = Regex::new(&pattern).ok()?;
    let mut start = None;
    let mut depth = 0usize;
    for token in tokens.captures_iter(text) {
        let whole = token.get(0)?;
        if token.name("close").is_some() {
            if let Some(begin) = start {
                depth -= 1;
                if depth == 0 {
                    return Some(text[begin..whole.end()].to_string());
                }
            }
            continue;
        }
        let tag_end = whole.start() + text[whole.start()..].find('>')?;
        if text[..tag_end].ends_with('/') {
            if start.is_none() {
                return Some(text[whole.start()..=tag_end].to_string());
            }
            continue;
        }
        start.get_or_insert(whole.start());
        depth += 1;
    }
    None
}

pub fn extract_svg(text: &str) -> Option<String> {
    extract(text, &SVG)
}

pub fn extract_code(text: &str) -> Option<String> {
    extract(text, &PYTHON)
}

/// Removes code-fence markers, keeping everything between them.
pub fn strip_fences(text: &str) -> String {
    FENCE_REGEX.replace_all(text, "").trim().to_string()
}

/// First contiguous block of table lines (starting with `|` or `+`).
pub fn extract_table(text: &str) -> Option<String> {
    let mut block: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('|') || trimmed.starts_with('+') {
            block.push(line.trim_end());
        } else if !block.is_empty() {
            break;
        }
    }
    if block.iter().any(|line| line.contains('|')) {
        Some(block.join("\n"))
    } else {
        None
    }
}

/// Source ready for the sandbox: fenced body when present, otherwise the
/// fence-stripped text, with interactive `plt.show()` calls removed.
pub fn clean_chart_code(text: &str) -> String {
    let code = extract_code(text).unwrap_or_else(|| strip_fences(text));
    PLT_SHOW_REGEX.replace_all(&code, "").trim().to_string()
}

/// At most `limit` words of `text`, ending on the last complete sentence
/// when one fits. Line breaks inside the kept part are preserved.
pub fn clip_words(text: &str, limit: usize) -> String {
    let text = text.trim();
    let mut words = 0usize;
    let mut in_word = false;
    let mut cut = None;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
            if words > limit {
                cut = Some(index);
                break;
            }
        }
    }
    let Some(cut) = cut else {
        return text.to_string();
    };
    let head = text[..cut].trim_end();
    match head.rfind(['.', '!', '?']) {
        Some(end) if end > 0 => head[..=end].to_string(),
        _ => head.to_string(),
    }
}

/// Base64 payload printed between `BASE64_START` and `BASE64_END`.
pub fn extract_marked_base64(output: &str) -> Option<String> {
    let captured = MARKED_BASE64_REGEX.captures(output)?.get(1)?.as_str();
    let payload: String = captured.chars().filter(|c| !c.is_whitespace()).collect();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SVG_BODY: &str = "<svg viewBox=\"0 0 10 10\" xmlns=\"http://www.w3.org/2000/svg\">\n  <circle cx=\"5\" cy=\"5\" r=\"4\" fill=\"#228B22\"/>\n</svg>";

    #[test]
    fn recovers_svg_from_prose_and_fences() {
        let wrapped = format!("Sure! Here is the map:\n```svg\n{SVG_BODY}\n```\nLet me know if you need changes.");
        assert_eq!(extract_svg(&wrapped).as_deref(), Some(SVG_BODY));
    }

    #[test]
    fn svg_match_is_case_insensitive_and_first_only() {
        let text = format!("<SVG width=\"1\"></SVG> and then {SVG_BODY}");
        assert_eq!(
            extract_svg(&text).as_deref(),
            Some("<SVG width=\"1\"></SVG>")
        );
    }

    #[test]
    fn nested_svg_is_returned_whole() {
        let nested = "<svg viewBox=\"0 0 10 10\"><svg x=\"0\"><rect/></svg><svg x=\"5\"><rect/></svg></svg>";
        let reply = format!("Before and after panels:\n{nested}\nThat is all.");
        assert_eq!(extract_svg(&reply).as_deref(), Some(nested));
    }

    #[test]
    fn unbalanced_nesting_is_none() {
        assert_eq!(
            extract_svg("<svg viewBox=\"0 0 10 10\"><svg x=\"0\"><rect/></svg>"),
            None
        );
    }

    #[test]
    fn self_closing_svg_is_complete() {
        assert_eq!(
            extract_svg("empty: <svg width=\"4\"/> done").as_deref(),
            Some("<svg width=\"4\"/>")
        );
        let outer = "<svg><use href=\"#a\"/><svg x=\"1\"/></svg>";
        assert_eq!(extract_svg(outer).as_deref(), Some(outer));
    }

    #[test]
    fn missing_svg_is_none() {
        assert_eq!(extract_svg("I cannot draw that, sorry."), None);
        assert_eq!(extract_svg("<svg viewBox=\"0 0 1 1\"> unterminated"), None);
        assert_eq!(extract_svg("<svgfoo></svg>"), None);
    }

    #[test]
    fn recovers_fenced_python() {
        let code = "import matplotlib.pyplot as plt\nplt.bar(['a'], [1])";
        let wrapped = format!("Here you go:\n```python\n{code}\n```\nEnjoy");
        assert_eq!(extract_code(&wrapped).as_deref(), Some(code));
        let bare = format!("```\n{code}\n```");
        assert_eq!(extract_code(&bare).as_deref(), Some(code));
    }

    #[test]
    fn unfenced_code_is_not_an_artifact() {
        assert_eq!(extract_code("print('hi')"), None);
        assert_eq!(extract_code("```python\n   \n```"), None);
    }

    #[test]
    fn any_language_fence() {
        let marker = Marker::Fence { languages: &[] };
        assert_eq!(
            extract("```xml\n<a/>\n```", &marker).as_deref(),
            Some("<a/>")
        );
    }

    #[test]
    fn strips_fence_markers() {
        assert_eq!(strip_fences("```python\nx = 1\n```"), "x = 1");
        assert_eq!(strip_fences("no fences here"), "no fences here");
    }

    #[test]
    fn cleans_chart_code() {
        let raw = "```python\nimport matplotlib.pyplot as plt\nplt.plot([1, 2])\nplt.show()\n```";
        assert_eq!(
            clean_chart_code(raw),
            "import matplotlib.pyplot as plt\nplt.plot([1, 2])"
        );
        assert_eq!(clean_chart_code("plt.plot([3])\nplt.show()"), "plt.plot([3])");
    }

    #[test]
    fn extracts_table_block() {
        let text = "Here is the table:\n```\n+------+-----+\n| Year | Qty |\n+------+-----+\n| 2000 | 10  |\n+------+-----+\n```\nDone.";
        let table = extract_table(text).unwrap();
        assert!(table.starts_with("+------+"));
        assert!(table.ends_with("+------+-----+"));
        assert_eq!(table.lines().count(), 5);
        assert_eq!(extract_table("just words"), None);
        assert_eq!(extract_table("+ plus line only"), None);
    }

    #[test]
    fn clips_to_whole_sentences() {
        let text = "Add an overview. Compare the highest values. Mention the overall trend clearly.";
        assert_eq!(clip_words(text, 7), "Add an overview. Compare the highest values.");
        assert_eq!(clip_words(text, 50), text);
        assert_eq!(clip_words("one two three four", 2), "one two");
        assert_eq!(clip_words("**Hint**\nGroup years.\nThen more words here", 3), "**Hint**\nGroup years.");
    }

    #[test]
    fn extracts_marked_base64() {
        let stdout = "warming up\nBASE64_STARTiVBORw0KGgo=BASE64_END\n";
        assert_eq!(extract_marked_base64(stdout).as_deref(), Some("iVBORw0KGgo="));
        assert_eq!(extract_marked_base64("nothing printed"), None);
    }
}

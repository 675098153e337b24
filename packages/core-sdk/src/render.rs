use once_cell::sync::Lazy;
use regex::Regex;

/** \brief 网络层失败时展示的固定文案。 */
pub const CONNECTION_ERROR: &str = "There is some error encountered in connection!";

// (?s) 让 `.` 匹配换行，`*?` 保证每对反引号各自成块。
static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(.*?)```").unwrap());

/**
 * \brief 转义 `& < > "`，使文本可以安全地放进 HTML。
 */
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/**
 * \brief 把 ``` 包裹的代码块转换为 `<pre><code>` 标记；未闭合的反引号原样保留。
 *
 * 先转义整段文本，再插入标记，输出中只有这里生成的标签。
 */
pub fn render_code_fences(text: &str) -> String {
    let escaped = escape_html(text);
    CODE_FENCE
        .replace_all(&escaped, "<pre><code>$1</code></pre>")
        .into_owned()
}

/**
 * \brief 以失败样式包裹一段文本（文本会被转义）。
 */
pub fn render_failure(text: &str) -> String {
    format!("<span style=\"color:red;\">{}</span>", escape_html(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_fence() {
        assert_eq!(
            render_code_fences("```print(1)```"),
            "<pre><code>print(1)</code></pre>"
        );
    }

    #[test]
    fn test_multiline_and_multiple_fences() {
        let src = "a\n```\nfn main() {}\n```\nb ```x``` c";
        assert_eq!(
            render_code_fences(src),
            "a\n<pre><code>\nfn main() {}\n</code></pre>\nb <pre><code>x</code></pre> c"
        );
    }

    #[test]
    fn test_unbalanced_fence_kept() {
        assert_eq!(render_code_fences("just ``` one"), "just ``` one");
        assert_eq!(render_code_fences("plain"), "plain");
    }

    #[test]
    fn test_failure_markup() {
        let s = render_failure("bad key");
        assert!(s.contains("bad key"));
        assert!(s.contains("color:red;"));
    }

    #[test]
    fn test_markup_inside_fence_is_escaped() {
        assert_eq!(
            render_code_fences("```let v: Vec<String> = x;<img src=x onerror=alert(1)>```"),
            "<pre><code>let v: Vec&lt;String&gt; = x;&lt;img src=x onerror=alert(1)&gt;</code></pre>"
        );
        assert_eq!(
            render_code_fences("a & b \"c\" <b>d</b>"),
            "a &amp; b &quot;c&quot; &lt;b&gt;d&lt;/b&gt;"
        );
    }

    #[test]
    fn test_failure_text_is_escaped() {
        assert_eq!(
            render_failure("<script>x</script>"),
            "<span style=\"color:red;\">&lt;script&gt;x&lt;/script&gt;</span>"
        );
    }
}

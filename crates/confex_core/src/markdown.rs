use std::fs;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::info;
use walkdir::WalkDir;

use crate::error::{ExportError, MarkupError};
use crate::layout::PAGE_EXTENSION;
use crate::normalize::rewrite_embedded_images;

pub const MARKDOWN_EXTENSION: &str = "md";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenderReport {
    pub files_converted: usize,
}

/// Second pass over an exported tree: normalize and convert every stored
/// markup file, writing a Markdown sibling next to it.
///
/// Runs independently of the export pass and in no particular order; the
/// original markup files are kept so the pass can be re-run and diffed.
/// Symbolic links are not followed; an entry that is neither a regular file
/// nor a directory stops the run.
pub fn render_tree(out_dir: &Path) -> Result<RenderReport, ExportError> {
    let mut report = RenderReport::default();
    if !out_dir.exists() {
        info!(
            "output directory {} does not exist, nothing to render",
            out_dir.display()
        );
        return Ok(report);
    }
    for entry in WalkDir::new(out_dir).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            return Err(ExportError::UnsupportedEntry {
                path: entry.path().to_path_buf(),
            });
        }
        let path = entry.path();
        if path.extension().and_then(|extension| extension.to_str()) != Some(PAGE_EXTENSION) {
            continue;
        }
        render_file(path)?;
        report.files_converted += 1;
    }
    Ok(report)
}

fn render_file(path: &Path) -> Result<(), ExportError> {
    info!("converting {}", path.display());
    let markup =
        fs::read_to_string(path).map_err(|error| ExportError::io("failed to read", path, error))?;
    let normalized =
        rewrite_embedded_images(&markup).map_err(|error| ExportError::markup(path, error))?;
    let markdown = to_markdown(&normalized).map_err(|error| ExportError::markup(path, error))?;

    let destination = path.with_extension(MARKDOWN_EXTENSION);
    fs::write(&destination, markdown)
        .map_err(|error| ExportError::io("failed to write", &destination, error))
}

/// Convert a normalized markup document to Markdown text.
///
/// Covers the element set the storage format actually produces; unknown
/// elements are transparent and contribute only their text content.
pub fn to_markdown(input: &str) -> Result<String, MarkupError> {
    let mut reader = Reader::from_str(input);
    let mut builder = MarkdownBuilder::new();

    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(Event::Start(element)) => builder.open(&element),
            Ok(Event::Empty(element)) => builder.void(&element),
            Ok(Event::End(element)) => builder.close(element.name().as_ref()),
            Ok(Event::Text(text)) => {
                let value = match text.decode() {
                    Ok(decoded) => match quick_xml::escape::unescape(&decoded) {
                        Ok(unescaped) => unescaped.into_owned(),
                        Err(_) => decoded.into_owned(),
                    },
                    Err(_) => String::from_utf8_lossy(text.as_ref()).into_owned(),
                };
                builder.text(&value);
            }
            Ok(Event::CData(data)) => {
                builder.raw(&String::from_utf8_lossy(data.as_ref()));
            }
            Ok(_) => {}
            Err(error) => return Err(MarkupError(error.to_string())),
        }
    }

    Ok(builder.finish())
}

#[derive(Debug)]
enum Frame {
    Heading(usize),
    Paragraph,
    Strong,
    Emphasis,
    Code,
    Pre,
    Link { href: String },
    List { ordered: bool, counter: usize },
    Item,
    Quote,
    Table { rows: Vec<Vec<String>> },
    Row { cells: Vec<String> },
    Cell,
}

#[derive(Debug)]
struct FrameState {
    kind: Frame,
    buf: String,
}

/// Accumulates Markdown while frames for open container elements stack up.
struct MarkdownBuilder {
    document: String,
    frames: Vec<FrameState>,
    /// Non-zero inside `pre`/`code`, where text is taken verbatim.
    raw_depth: usize,
}

impl MarkdownBuilder {
    fn new() -> Self {
        Self {
            document: String::new(),
            frames: Vec::new(),
            raw_depth: 0,
        }
    }

    fn open(&mut self, element: &BytesStart<'_>) {
        let kind = match element.name().as_ref() {
            b"h1" => Frame::Heading(1),
            b"h2" => Frame::Heading(2),
            b"h3" => Frame::Heading(3),
            b"h4" => Frame::Heading(4),
            b"h5" => Frame::Heading(5),
            b"h6" => Frame::Heading(6),
            b"p" => Frame::Paragraph,
            b"strong" | b"b" => Frame::Strong,
            b"em" | b"i" => Frame::Emphasis,
            b"code" => Frame::Code,
            b"pre" => Frame::Pre,
            b"a" => Frame::Link {
                href: attribute_value(element, b"href").unwrap_or_default(),
            },
            b"ul" => Frame::List {
                ordered: false,
                counter: 0,
            },
            b"ol" => Frame::List {
                ordered: true,
                counter: 0,
            },
            b"li" => Frame::Item,
            b"blockquote" => Frame::Quote,
            b"table" => Frame::Table { rows: Vec::new() },
            b"tr" => Frame::Row { cells: Vec::new() },
            b"td" | b"th" => Frame::Cell,
            _ => return,
        };
        if matches!(kind, Frame::Code | Frame::Pre) {
            self.raw_depth += 1;
        }
        self.frames.push(FrameState {
            kind,
            buf: String::new(),
        });
    }

    fn void(&mut self, element: &BytesStart<'_>) {
        match element.name().as_ref() {
            b"br" => {
                if self.raw_depth > 0 {
                    self.buf().push('\n');
                } else {
                    self.buf().push_str("  \n");
                }
            }
            b"hr" => self.append_block("---"),
            b"img" => {
                let src = attribute_value(element, b"src").unwrap_or_default();
                let alt = attribute_value(element, b"alt").unwrap_or_default();
                let rendered = format!("![{alt}]({src})");
                self.buf().push_str(&rendered);
            }
            _ => {}
        }
    }

    fn close(&mut self, local: &[u8]) {
        let matches_top = |kind: &Frame| match local {
            b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6" => matches!(kind, Frame::Heading(_)),
            b"p" => matches!(kind, Frame::Paragraph),
            b"strong" | b"b" => matches!(kind, Frame::Strong),
            b"em" | b"i" => matches!(kind, Frame::Emphasis),
            b"code" => matches!(kind, Frame::Code),
            b"pre" => matches!(kind, Frame::Pre),
            b"a" => matches!(kind, Frame::Link { .. }),
            b"ul" | b"ol" => matches!(kind, Frame::List { .. }),
            b"li" => matches!(kind, Frame::Item),
            b"blockquote" => matches!(kind, Frame::Quote),
            b"table" => matches!(kind, Frame::Table { .. }),
            b"tr" => matches!(kind, Frame::Row { .. }),
            b"td" | b"th" => matches!(kind, Frame::Cell),
            _ => false,
        };
        let top_is_match = self
            .frames
            .last()
            .is_some_and(|frame| matches_top(&frame.kind));
        if !top_is_match {
            return;
        }
        let Some(frame) = self.frames.pop() else {
            return;
        };
        if matches!(frame.kind, Frame::Code | Frame::Pre) {
            self.raw_depth = self.raw_depth.saturating_sub(1);
        }
        self.fold(frame);
    }

    fn fold(&mut self, frame: FrameState) {
        let FrameState { kind, buf } = frame;
        match kind {
            Frame::Heading(level) => {
                let content = buf.trim();
                if !content.is_empty() {
                    self.append_block(&format!("{} {}", "#".repeat(level), content));
                }
            }
            Frame::Paragraph => {
                let content = buf.trim();
                if !content.is_empty() {
                    self.append_block(content);
                }
            }
            Frame::Strong => self.append_wrapped(&buf, "**"),
            Frame::Emphasis => self.append_wrapped(&buf, "*"),
            Frame::Code => {
                let content = buf.trim();
                if !content.is_empty() {
                    let rendered = if content.contains('`') {
                        format!("`` {content} ``")
                    } else {
                        format!("`{content}`")
                    };
                    self.buf().push_str(&rendered);
                }
            }
            Frame::Pre => {
                let content = buf.trim_matches('\n').trim_end();
                let fence = if content.contains("```") { "````" } else { "```" };
                self.append_block(&format!("{fence}\n{content}\n{fence}"));
            }
            Frame::Link { href } => {
                let content = buf.trim();
                if href.is_empty() {
                    self.buf().push_str(content);
                } else if content.is_empty() {
                    let rendered = format!("[{href}]({href})");
                    self.buf().push_str(&rendered);
                } else {
                    let rendered = format!("[{content}]({href})");
                    self.buf().push_str(&rendered);
                }
            }
            Frame::List { .. } => {
                let content = buf.trim_end().to_string();
                if content.is_empty() {
                    return;
                }
                // A nested list continues its parent item; the item fold
                // indents the continuation lines.
                let nested_in_item = matches!(
                    self.frames.last().map(|frame| &frame.kind),
                    Some(Frame::Item)
                );
                if nested_in_item {
                    let buf = self.buf();
                    buf.push('\n');
                    buf.push_str(&content);
                } else {
                    self.append_block(&content);
                }
            }
            Frame::Item => {
                let content = buf.trim().to_string();
                let marker = match self.frames.last_mut() {
                    Some(FrameState {
                        kind: Frame::List { ordered, counter },
                        ..
                    }) => {
                        if *ordered {
                            *counter += 1;
                            format!("{counter}. ")
                        } else {
                            "- ".to_string()
                        }
                    }
                    _ => "- ".to_string(),
                };
                let buf = self.buf();
                if !buf.is_empty() {
                    buf.push('\n');
                }
                let mut lines = content.lines();
                if let Some(first) = lines.next() {
                    buf.push_str(&marker);
                    buf.push_str(first);
                }
                for line in lines {
                    buf.push('\n');
                    if !line.is_empty() {
                        buf.push_str("    ");
                        buf.push_str(line);
                    }
                }
            }
            Frame::Quote => {
                let content = buf.trim().to_string();
                if content.is_empty() {
                    return;
                }
                let quoted = content
                    .lines()
                    .map(|line| format!("> {line}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.append_block(&quoted);
            }
            Frame::Table { rows } => {
                if let Some(rendered) = format_table(&rows) {
                    self.append_block(&rendered);
                }
            }
            Frame::Row { cells } => {
                if let Some(FrameState {
                    kind: Frame::Table { rows },
                    ..
                }) = self.frames.last_mut()
                {
                    rows.push(cells);
                }
            }
            Frame::Cell => {
                let content = buf.trim().replace('\n', " ").replace('|', "\\|");
                if let Some(FrameState {
                    kind: Frame::Row { cells },
                    ..
                }) = self.frames.last_mut()
                {
                    cells.push(content);
                }
            }
        }
    }

    fn text(&mut self, value: &str) {
        if self.raw_depth > 0 {
            self.buf().push_str(value);
            return;
        }
        let after_whitespace = {
            let current = self.current();
            current.is_empty() || current.ends_with(|ch: char| ch.is_whitespace())
        };
        let collapsed = collapse_whitespace(value, after_whitespace);
        if collapsed.is_empty() {
            return;
        }
        // Inter-element whitespace inside list and table scaffolding is noise.
        if collapsed.trim().is_empty() && self.in_structural_frame() {
            return;
        }
        let escaped = escape_markdown(&collapsed);
        self.buf().push_str(&escaped);
    }

    fn raw(&mut self, value: &str) {
        self.buf().push_str(value);
    }

    fn finish(mut self) -> String {
        // Fold anything a truncated document left open.
        while let Some(frame) = self.frames.pop() {
            if matches!(frame.kind, Frame::Code | Frame::Pre) {
                self.raw_depth = self.raw_depth.saturating_sub(1);
            }
            self.fold(frame);
        }
        let trimmed = self.document.trim();
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}\n")
        }
    }

    fn buf(&mut self) -> &mut String {
        match self.frames.last_mut() {
            Some(frame) => &mut frame.buf,
            None => &mut self.document,
        }
    }

    fn current(&self) -> &str {
        match self.frames.last() {
            Some(frame) => &frame.buf,
            None => &self.document,
        }
    }

    fn in_structural_frame(&self) -> bool {
        matches!(
            self.frames.last().map(|frame| &frame.kind),
            Some(Frame::List { .. }) | Some(Frame::Table { .. }) | Some(Frame::Row { .. })
        )
    }

    fn append_block(&mut self, content: &str) {
        let buf = self.buf();
        while buf.ends_with(' ') {
            buf.pop();
        }
        if !buf.is_empty() {
            while !buf.ends_with("\n\n") {
                buf.push('\n');
            }
        }
        buf.push_str(content);
    }

    fn append_wrapped(&mut self, content: &str, delimiter: &str) {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return;
        }
        let leading = content.starts_with(|ch: char| ch.is_whitespace());
        let trailing = content.ends_with(|ch: char| ch.is_whitespace());
        let buf = self.buf();
        if leading && !buf.is_empty() && !buf.ends_with(|ch: char| ch.is_whitespace()) {
            buf.push(' ');
        }
        buf.push_str(delimiter);
        buf.push_str(trimmed);
        buf.push_str(delimiter);
        if trailing {
            buf.push(' ');
        }
    }
}

fn format_table(rows: &[Vec<String>]) -> Option<String> {
    let (header, body) = rows.split_first()?;
    if header.is_empty() {
        return None;
    }
    let mut lines = vec![format_row(header)];
    lines.push(format!("|{}", " --- |".repeat(header.len())));
    for row in body {
        lines.push(format_row(row));
    }
    Some(lines.join("\n"))
}

fn format_row(cells: &[String]) -> String {
    let mut line = String::from("|");
    for cell in cells {
        line.push(' ');
        line.push_str(cell);
        line.push_str(" |");
    }
    line
}

fn collapse_whitespace(text: &str, after_whitespace: bool) -> String {
    let mut output = String::with_capacity(text.len());
    let mut last_was_whitespace = after_whitespace;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_whitespace {
                output.push(' ');
            }
            last_was_whitespace = true;
        } else {
            output.push(ch);
            last_was_whitespace = false;
        }
    }
    output
}

fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '\\' | '*' | '_' | '`' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn attribute_value(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attribute| attribute.key.as_ref() == name)
        .map(|attribute| match attribute.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attribute.value).into_owned(),
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{render_tree, to_markdown};

    #[test]
    fn headings_and_paragraphs() {
        let markdown =
            to_markdown("<h1>Title</h1><p>First paragraph.</p><p>Second one.</p>").expect("convert");
        assert_eq!(markdown, "# Title\n\nFirst paragraph.\n\nSecond one.\n");
    }

    #[test]
    fn inline_emphasis_and_code() {
        let markdown =
            to_markdown("<p>Mix of <strong>bold</strong>, <em>italic</em> and <code>mono</code>.</p>")
                .expect("convert");
        assert_eq!(markdown, "Mix of **bold**, *italic* and `mono`.\n");
    }

    #[test]
    fn links_become_inline_references() {
        let markdown = to_markdown(r#"<p>See <a href="https://example.org/doc">the doc</a>.</p>"#)
            .expect("convert");
        assert_eq!(markdown, "See [the doc](https://example.org/doc).\n");
    }

    #[test]
    fn rewritten_images_render_with_line_break() {
        let markdown = to_markdown(concat!(
            r#"<p>Before</p>"#,
            r#"<img src="attachments/diagram.png" alt="attachments/diagram.png"/><br/>"#,
            r#"<p>After</p>"#,
        ))
        .expect("convert");
        assert!(markdown.contains("![attachments/diagram.png](attachments/diagram.png)"));
        assert!(markdown.contains("Before"));
        assert!(markdown.contains("After"));
    }

    #[test]
    fn unordered_and_ordered_lists() {
        let markdown =
            to_markdown("<ul><li>alpha</li><li>beta</li></ul><ol><li>one</li><li>two</li></ol>")
                .expect("convert");
        assert_eq!(markdown, "- alpha\n- beta\n\n1. one\n2. two\n");
    }

    #[test]
    fn nested_lists_indent_under_their_item() {
        let markdown =
            to_markdown("<ul><li>outer<ul><li>inner</li></ul></li></ul>").expect("convert");
        assert_eq!(markdown, "- outer\n    - inner\n");
    }

    #[test]
    fn preformatted_blocks_are_fenced() {
        let markdown =
            to_markdown("<pre>let x = 1;\nlet y = 2;</pre>").expect("convert");
        assert_eq!(markdown, "```\nlet x = 1;\nlet y = 2;\n```\n");
    }

    #[test]
    fn blockquotes_are_prefixed() {
        let markdown = to_markdown("<blockquote><p>quoted text</p></blockquote>").expect("convert");
        assert_eq!(markdown, "> quoted text\n");
    }

    #[test]
    fn tables_become_pipe_tables() {
        let markdown = to_markdown(concat!(
            "<table>",
            "<tr><th>Name</th><th>Value</th></tr>",
            "<tr><td>a</td><td>1</td></tr>",
            "</table>",
        ))
        .expect("convert");
        assert_eq!(
            markdown,
            "| Name | Value |\n| --- | --- |\n| a | 1 |\n"
        );
    }

    #[test]
    fn unknown_elements_are_transparent() {
        let markdown = to_markdown(
            "<ac:structured-macro ac:name=\"info\"><ac:rich-text-body><p>note body</p></ac:rich-text-body></ac:structured-macro>",
        )
        .expect("convert");
        assert_eq!(markdown, "note body\n");
    }

    #[test]
    fn markdown_specials_in_text_are_escaped() {
        let markdown = to_markdown("<p>stars * and under_scores</p>").expect("convert");
        assert_eq!(markdown, "stars \\* and under\\_scores\n");
    }

    #[test]
    fn render_tree_adds_md_siblings_and_keeps_html() {
        let temp = tempdir().expect("tempdir");
        let out = temp.path().join("out");
        fs::create_dir_all(out.join("SPACE")).expect("mkdir");
        fs::write(out.join("SPACE/index.html"), "<h1>Home</h1>").expect("write");
        fs::write(
            out.join("SPACE/Child.html"),
            r#"<p>pic</p><ac:image><ri:attachment ri:filename="diagram.png"/></ac:image>"#,
        )
        .expect("write");
        fs::write(out.join("SPACE/notes.txt"), "not markup").expect("write");

        let report = render_tree(&out).expect("render");
        assert_eq!(report.files_converted, 2);

        assert!(out.join("SPACE/index.html").is_file());
        assert!(out.join("SPACE/Child.html").is_file());
        assert!(!out.join("SPACE/notes.md").exists());

        let home = fs::read_to_string(out.join("SPACE/index.md")).expect("read");
        assert_eq!(home, "# Home\n");
        let child = fs::read_to_string(out.join("SPACE/Child.md")).expect("read");
        assert!(child.contains("![attachments/diagram.png](attachments/diagram.png)"));
    }

    #[test]
    fn render_tree_is_rerunnable() {
        let temp = tempdir().expect("tempdir");
        let out = temp.path().join("out");
        fs::create_dir_all(&out).expect("mkdir");
        fs::write(out.join("page.html"), "<p>stable</p>").expect("write");

        render_tree(&out).expect("first run");
        let first = fs::read_to_string(out.join("page.md")).expect("read");
        render_tree(&out).expect("second run");
        let second = fs::read_to_string(out.join("page.md")).expect("read");
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_in_the_tree_are_fatal() {
        use crate::error::ExportError;

        let temp = tempdir().expect("tempdir");
        let out = temp.path().join("out");
        fs::create_dir_all(&out).expect("mkdir");
        fs::write(out.join("page.html"), "<p>x</p>").expect("write");
        std::os::unix::fs::symlink(out.join("page.html"), out.join("alias.html"))
            .expect("symlink");

        let result = render_tree(&out);
        assert!(matches!(result, Err(ExportError::UnsupportedEntry { .. })));
    }
}

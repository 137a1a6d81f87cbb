use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};

use crate::attachments::ATTACHMENT_FOLDER_NAME;
use crate::error::MarkupError;

/// The service-specific embedded image element in storage-format markup.
const EMBEDDED_IMAGE_TAG: &[u8] = b"ac:image";
/// Attribute on the embedded image's child element that names the attachment.
const FILENAME_ATTRIBUTE: &[u8] = b"ri:filename";

/// Rewrite every embedded image element into a plain `<img>` pointing at
/// the locally downloaded attachment, followed by a line break.
///
/// The filename comes from the first child element's `ri:filename`
/// attribute; an embedded image without one is emitted untouched. The
/// filename is not re-sanitized here: the attachment was already written to
/// disk under its sanitized name at download time. Idempotent once no
/// embedded image remains.
pub fn rewrite_embedded_images(input: &str) -> Result<String, MarkupError> {
    let mut reader = Reader::from_str(input);
    let mut writer = Writer::new(Vec::new());

    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) if start.name().as_ref() == EMBEDDED_IMAGE_TAG => {
                let (inner, end) = collect_subtree(&mut reader, EMBEDDED_IMAGE_TAG)?;
                match first_child_filename(&inner) {
                    Some(filename) => write_image(&mut writer, &filename)?,
                    None => {
                        write(&mut writer, Event::Start(start))?;
                        for event in inner {
                            write(&mut writer, event)?;
                        }
                        write(&mut writer, Event::End(end))?;
                    }
                }
            }
            Ok(event) => write(&mut writer, event)?,
            Err(error) => return Err(MarkupError(error.to_string())),
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|error| MarkupError(error.to_string()))
}

/// Collect all events up to (not including) the end tag matching `name`,
/// which is returned separately. Handles nested elements of the same name.
fn collect_subtree<'a>(
    reader: &mut Reader<&'a [u8]>,
    name: &[u8],
) -> Result<(Vec<Event<'a>>, BytesEnd<'a>), MarkupError> {
    let mut depth = 0usize;
    let mut inner = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.name().as_ref() == name => {
                depth += 1;
                inner.push(Event::Start(start));
            }
            Ok(Event::End(end)) if end.name().as_ref() == name => {
                if depth == 0 {
                    return Ok((inner, end));
                }
                depth -= 1;
                inner.push(Event::End(end));
            }
            Ok(Event::Eof) => {
                return Err(MarkupError(format!(
                    "unclosed <{}> element",
                    String::from_utf8_lossy(name)
                )));
            }
            Ok(event) => inner.push(event),
            Err(error) => return Err(MarkupError(error.to_string())),
        }
    }
}

/// The `ri:filename` attribute of the first child element, if any.
fn first_child_filename(events: &[Event<'_>]) -> Option<String> {
    for event in events {
        match event {
            Event::Start(element) | Event::Empty(element) => {
                return attribute_value(element, FILENAME_ATTRIBUTE);
            }
            _ => {}
        }
    }
    None
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

fn write_image(writer: &mut Writer<Vec<u8>>, filename: &str) -> Result<(), MarkupError> {
    let reference = format!("{ATTACHMENT_FOLDER_NAME}/{filename}");
    let mut image = BytesStart::new("img");
    image.push_attribute(("src", reference.as_str()));
    image.push_attribute(("alt", reference.as_str()));
    write(writer, Event::Empty(image))?;
    write(writer, Event::Empty(BytesStart::new("br")))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), MarkupError> {
    writer
        .write_event(event)
        .map_err(|error| MarkupError(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::rewrite_embedded_images;

    #[test]
    fn embedded_image_becomes_relative_img_and_break() {
        let input = r#"<p>Before</p><ac:image><ri:attachment ri:filename="diagram.png"/></ac:image><p>After</p>"#;
        let output = rewrite_embedded_images(input).expect("rewrite");
        assert_eq!(
            output,
            r#"<p>Before</p><img src="attachments/diagram.png" alt="attachments/diagram.png"/><br/><p>After</p>"#
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let input = r#"<ac:image><ri:attachment ri:filename="a.png"/></ac:image>"#;
        let once = rewrite_embedded_images(input).expect("first pass");
        let twice = rewrite_embedded_images(&once).expect("second pass");
        assert_eq!(once, twice);
    }

    #[test]
    fn image_without_filename_is_left_untouched() {
        let input = r#"<ac:image><ri:url ri:value="https://elsewhere.example/x.png"/></ac:image>"#;
        let output = rewrite_embedded_images(input).expect("rewrite");
        assert_eq!(output, input);
    }

    #[test]
    fn empty_image_element_is_left_untouched() {
        let input = r#"<p>text</p><ac:image></ac:image>"#;
        let output = rewrite_embedded_images(input).expect("rewrite");
        assert_eq!(output, input);
    }

    #[test]
    fn documents_without_embedded_images_pass_through() {
        let input = "<h1>Title</h1><p>Body with <strong>bold</strong>.</p>";
        let output = rewrite_embedded_images(input).expect("rewrite");
        assert_eq!(output, input);
    }

    #[test]
    fn only_the_first_child_element_is_consulted() {
        let input = r#"<ac:image><ri:attachment ri:filename="first.png"/><ri:attachment ri:filename="second.png"/></ac:image>"#;
        let output = rewrite_embedded_images(input).expect("rewrite");
        assert!(output.contains("attachments/first.png"));
        assert!(!output.contains("second.png"));
    }

    #[test]
    fn multiple_images_are_each_rewritten() {
        let input = concat!(
            r#"<ac:image><ri:attachment ri:filename="a.png"/></ac:image>"#,
            r#"<p>mid</p>"#,
            r#"<ac:image><ri:attachment ri:filename="b.png"/></ac:image>"#,
        );
        let output = rewrite_embedded_images(input).expect("rewrite");
        assert!(output.contains(r#"<img src="attachments/a.png" alt="attachments/a.png"/><br/>"#));
        assert!(output.contains(r#"<img src="attachments/b.png" alt="attachments/b.png"/><br/>"#));
    }
}

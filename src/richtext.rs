use pulldown_cmark::{Event as MdEvent, Options, Parser as MdParser, Tag as MdTag, TagEnd as MdTagEnd};
use std::str::FromStr;

use crate::properties::RecordId;

/// Scheme of explicit cross-reference links inside authored text: `[see](rec:person:12)`.
pub const RECORD_LINK_SCHEME: &str = "rec:";

/// The rich text collaborator consumed by the mentions index. Implementations turn authored markup
/// into plain text for scanning and report the record links it contains.
pub trait RichText: Send + Sync {
    fn plain_text(&self, markup: &str) -> String;

    fn is_empty(&self, markup: &str) -> bool {
        self.plain_text(markup).trim().is_empty()
    }

    /// Link destinations found in the markup, in document order
    fn hrefs(&self, markup: &str) -> Vec<String>;

    /// Records explicitly linked from the markup through `rec:` hrefs. Malformed links are
    /// ignored.
    fn record_links(&self, markup: &str) -> Vec<RecordId> {
        self.hrefs(markup)
            .iter()
            .filter_map(|href| href.strip_prefix(RECORD_LINK_SCHEME))
            .filter_map(|id| RecordId::from_str(id).ok())
            .collect()
    }
}

/// CommonMark markup, parsed with pulldown-cmark.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownText;

fn md_options() -> Options {
    let mut md_options = Options::empty();
    md_options.insert(Options::ENABLE_TABLES);
    md_options.insert(Options::ENABLE_STRIKETHROUGH);
    md_options.insert(Options::ENABLE_FOOTNOTES);
    md_options
}

impl RichText for MarkdownText {
    fn plain_text(&self, markup: &str) -> String {
        let mut plain = String::with_capacity(markup.len());
        for event in MdParser::new_ext(markup, md_options()) {
            match event {
                MdEvent::Text(text) | MdEvent::Code(text) => plain.push_str(&text),
                MdEvent::SoftBreak | MdEvent::HardBreak => plain.push(' '),
                MdEvent::End(MdTagEnd::Paragraph)
                | MdEvent::End(MdTagEnd::Heading(_))
                | MdEvent::End(MdTagEnd::Item)
                | MdEvent::End(MdTagEnd::TableCell)
                | MdEvent::End(MdTagEnd::CodeBlock) => plain.push('\n'),
                _ => {}
            }
        }
        plain
    }

    fn hrefs(&self, markup: &str) -> Vec<String> {
        MdParser::new_ext(markup, md_options())
            .filter_map(|event| match event {
                MdEvent::Start(MdTag::Link { dest_url, .. }) => Some(dest_url.to_string()),
                _ => None,
            })
            .collect()
    }
}

//! Normalisation applied to text before it is submitted as post or comment
//! content.

use std::borrow::Cow;

/// Marker whose presence means the text is already paragraph-wrapped HTML.
pub const PARAGRAPH_MARKER: &str = "<p>";

/// Wrap raw text in a single `<p>` element unless it already contains one.
///
/// Text that contains the marker is returned unchanged (borrowed).
pub fn wrap_paragraph(content: &str) -> Cow<'_, str> {
    if content.contains(PARAGRAPH_MARKER) {
        Cow::Borrowed(content)
    } else {
        Cow::Owned(format!("<p>{content}</p>"))
    }
}

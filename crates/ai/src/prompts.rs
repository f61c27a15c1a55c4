//! Default prompt templates, keyed by [`PromptType`].
//!
//! Every template mentions `{bbox_scale}`: coordinates emitted by the model are
//! normalized to `0..=bbox_scale`, so callers need the same scale to map them back
//! onto the page.

use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

pub const BBOX_SCALE_PLACEHOLDER: &str = "{bbox_scale}";

const ALLOWED_TAGS: &str = "p, h1, h2, h3, h4, h5, h6, ul, ol, li, table, thead, tbody, tr, th, td, \
caption, b, i, u, sup, sub, br, math, img, figure, figcaption, code, pre, blockquote, div, span";

const LAYOUT_LABELS: &str = "Caption, Footnote, Equation-Block, List-Group, Page-Header, \
Page-Footer, Image, Section-Header, Table, Text, Complex-Block, Code-Block, Form, \
Table-Of-Contents, Figure";

const GUIDELINES: &str = "Guidelines:
* Inline math: wrap in <math>...</math> using KaTeX compatible LaTeX.
* Block math: use <math display=\"block\">...</math>.
* Tables: use colspan and rowspan to keep the structure of merged cells.
* Checkboxes: use the characters ☐ and ☑.
* Images: describe the content in the alt attribute of an <img> tag.
* Keep the reading order of the page. Do not add content that is not on the page.";

const OCR_LAYOUT_TEMPLATE: &str = concat!(
    "OCR this image to HTML, arranged as layout blocks. ",
    "Each layout block is a <div> with a data-bbox attribute holding the block's bounding box ",
    "as \"x0 y0 x1 y1\", normalized to 0-{bbox_scale}, and a data-label attribute naming the block type.\n",
    "Labels: {labels}\n",
    "Only use these tags inside blocks: {tags}.\n",
    "{guidelines}"
);

const OCR_TEMPLATE: &str = concat!(
    "OCR this image to HTML.\n",
    "Only use these tags: {tags}.\n",
    "When the image contains figures, give each <img> a data-bbox attribute with its bounding box ",
    "as \"x0 y0 x1 y1\", normalized to 0-{bbox_scale}.\n",
    "{guidelines}"
);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, AsRefStr, Display, EnumIter, EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum PromptType {
    /// HTML with one `data-bbox` annotated div per layout block.
    #[default]
    OcrLayout,
    /// Plain HTML transcription of the page.
    Ocr,
}

impl PromptType {
    /// The template with its `{bbox_scale}` placeholder still in place.
    pub fn template(&self) -> String {
        let template = match self {
            PromptType::OcrLayout => OCR_LAYOUT_TEMPLATE.replace("{labels}", LAYOUT_LABELS),
            PromptType::Ocr => OCR_TEMPLATE.to_string(),
        };
        template
            .replace("{tags}", ALLOWED_TAGS)
            .replace("{guidelines}", GUIDELINES)
    }
}

pub fn render_prompt(prompt_type: PromptType, bbox_scale: u32) -> String {
    prompt_type
        .template()
        .replace(BBOX_SCALE_PLACEHOLDER, &bbox_scale.to_string())
}

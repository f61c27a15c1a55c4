use image::DynamicImage;
use strum_macros::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Image { image: DynamicImage },
    Text { text: String },
}

/// One chat turn. Blocks keep their order when rendered.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn images(&self) -> impl Iterator<Item = &DynamicImage> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::Image { image } => Some(image),
            ContentBlock::Text { .. } => None,
        })
    }
}

/// Every image across `messages`, in message order then block order.
pub fn collect_images(messages: &[Message]) -> Vec<&DynamicImage> {
    messages.iter().flat_map(|m| m.images()).collect()
}

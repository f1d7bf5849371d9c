use async_trait::async_trait;

use super::{ChatMessage, MessagePart, Role};
use crate::error::ProviderError;
use crate::evaluation::FileProcessingMode;

/// Turns opaque file ids into something a model message can carry.
///
/// The run engine never touches file bytes; it only asks for a reference or
/// for text already extracted by an OCR provider.
#[async_trait]
pub trait FileAttachmentResolver: Send + Sync {
    async fn reference(&self, file_id: &str) -> Result<String, ProviderError>;

    async fn extract_text(
        &self,
        file_id: &str,
        ocr_provider: Option<&str>,
    ) -> Result<String, ProviderError>;
}

/// Maps file ids to `file://` references under a storage prefix. Has no OCR.
pub struct PassthroughResolver {
    prefix: String,
}

impl PassthroughResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl FileAttachmentResolver for PassthroughResolver {
    async fn reference(&self, file_id: &str) -> Result<String, ProviderError> {
        Ok(format!("file://{}/{}", self.prefix, file_id))
    }

    async fn extract_text(
        &self,
        _file_id: &str,
        ocr_provider: Option<&str>,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "text extraction via {}",
            ocr_provider.unwrap_or("default OCR provider")
        )))
    }
}

/// Build the user message for a rendered prompt and its attachments.
pub async fn build_user_message(
    resolver: &dyn FileAttachmentResolver,
    text: &str,
    attachments: &[String],
    mode: FileProcessingMode,
    ocr_provider: Option<&str>,
) -> Result<ChatMessage, ProviderError> {
    let mut parts = Vec::with_capacity(attachments.len() + 1);

    match mode {
        FileProcessingMode::Native => {
            parts.push(MessagePart::Text {
                text: text.to_string(),
            });
            for file_id in attachments {
                let reference = resolver.reference(file_id).await?;
                parts.push(MessagePart::File {
                    file_id: file_id.clone(),
                    reference,
                });
            }
        }
        FileProcessingMode::Ocr => {
            let mut full_text = text.to_string();
            for file_id in attachments {
                let extracted = resolver.extract_text(file_id, ocr_provider).await?;
                full_text.push_str("\n\n");
                full_text.push_str(&extracted);
            }
            parts.push(MessagePart::Text { text: full_text });
        }
    }

    Ok(ChatMessage {
        role: Role::User,
        parts,
    })
}

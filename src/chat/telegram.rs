use super::{AudioSource, AudioUpload, ChatClient, ChatError, DeliveredAudio, MessageRef};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, FileId, InputFile, InputMedia, InputMediaAudio, Message, MessageId, ParseMode,
};
use teloxide::{ApiError, RequestError};

/// [`ChatClient`] backed by a teloxide [`Bot`].
#[derive(Clone)]
pub struct TelegramChat {
    bot: Bot,
}

impl TelegramChat {
    /// Wrap a teloxide bot
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// Translate a teloxide error into the pipeline's chat error kinds.
#[must_use]
pub fn map_request_error(err: RequestError) -> ChatError {
    match err {
        RequestError::RetryAfter(secs) => ChatError::RateLimited {
            retry_after: secs.duration(),
        },
        RequestError::Api(ApiError::MessageNotModified) => ChatError::NotModified,
        RequestError::Api(
            ApiError::MessageToEditNotFound
            | ApiError::MessageToDeleteNotFound
            | ApiError::MessageIdInvalid,
        ) => ChatError::MessageNotFound,
        RequestError::Network(e) => ChatError::Network(e.to_string()),
        RequestError::Io(e) => ChatError::Network(e.to_string()),
        other => ChatError::Api(other.to_string()),
    }
}

fn input_file(source: &AudioSource) -> InputFile {
    match source {
        AudioSource::File(path) => InputFile::file(path.clone()),
        AudioSource::FileId(id) => InputFile::file_id(FileId(id.clone())),
    }
}

fn delivered(msg: &Message) -> DeliveredAudio {
    DeliveredAudio {
        message: MessageRef::new(msg.chat.id.0, msg.id.0),
        file_id: msg.audio().map(|a| a.file.id.0.clone()),
    }
}

#[async_trait]
impl ChatClient for TelegramChat {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef, ChatError> {
        let msg = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(map_request_error)?;
        Ok(MessageRef::new(msg.chat.id.0, msg.id.0))
    }

    async fn edit_message_text(&self, message: MessageRef, text: &str) -> Result<(), ChatError> {
        self.bot
            .edit_message_text(
                ChatId(message.chat_id),
                MessageId(message.message_id),
                text,
            )
            .parse_mode(ParseMode::Html)
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn edit_message_media(
        &self,
        message: MessageRef,
        audio: &AudioUpload,
    ) -> Result<DeliveredAudio, ChatError> {
        let mut media = InputMediaAudio::new(input_file(&audio.source))
            .title(audio.title.clone())
            .performer(audio.performer.clone());
        if let Some(duration) = audio.duration_secs {
            media = media.duration(u16::try_from(duration).unwrap_or(u16::MAX));
        }
        if let Some(caption) = &audio.caption {
            media = media.caption(caption.clone()).parse_mode(ParseMode::Html);
        }

        let msg = self
            .bot
            .edit_message_media(
                ChatId(message.chat_id),
                MessageId(message.message_id),
                InputMedia::Audio(media),
            )
            .await
            .map_err(map_request_error)?;
        Ok(delivered(&msg))
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), ChatError> {
        self.bot
            .delete_message(ChatId(message.chat_id), MessageId(message.message_id))
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn send_audio(
        &self,
        chat_id: i64,
        audio: &AudioUpload,
    ) -> Result<DeliveredAudio, ChatError> {
        let mut req = self
            .bot
            .send_audio(ChatId(chat_id), input_file(&audio.source))
            .title(audio.title.clone())
            .performer(audio.performer.clone());
        if let Some(duration) = audio.duration_secs {
            req = req.duration(duration);
        }
        if let Some(caption) = &audio.caption {
            req = req.caption(caption.clone()).parse_mode(ParseMode::Html);
        }

        let msg = req.await.map_err(map_request_error)?;
        Ok(delivered(&msg))
    }
}

//! Test doubles shared by unit tests.

use crate::chat::{AudioSource, AudioUpload, ChatClient, ChatError, DeliveredAudio, MessageRef};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

/// A recorded chat call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    /// `send_message`
    SendMessage {
        /// Destination chat
        chat_id: i64,
        /// Text
        text: String,
    },
    /// `edit_message_text`
    EditText {
        /// Edited message
        message: MessageRef,
        /// New text
        text: String,
    },
    /// `edit_message_media`
    EditMedia {
        /// Edited message
        message: MessageRef,
        /// Audio title
        title: String,
    },
    /// `delete_message`
    Delete {
        /// Deleted message
        message: MessageRef,
    },
    /// `send_audio`
    SendAudio {
        /// Destination chat
        chat_id: i64,
        /// Audio title
        title: String,
        /// Payload source
        source: AudioSource,
    },
}

/// Recording chat client with scripted failures
#[derive(Default)]
pub struct FakeChat {
    next_id: AtomicI32,
    calls: Mutex<Vec<ChatCall>>,
    deleted: Mutex<HashSet<MessageRef>>,
    text_errors: Mutex<VecDeque<ChatError>>,
    audio_errors: Mutex<VecDeque<ChatError>>,
    upload_gate: Option<Arc<Semaphore>>,
}

impl FakeChat {
    /// Client answering every call successfully
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Client whose audio uploads block until the returned gate gets permits
    #[must_use]
    pub fn with_blocked_uploads() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let chat = Self {
            upload_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (chat, gate)
    }

    /// Fail the next text calls (send, edit, delete) with these errors, in order
    pub fn fail_text(&self, errors: impl IntoIterator<Item = ChatError>) {
        self.text_errors.lock().extend(errors);
    }

    /// Fail the next audio calls with these errors, in order
    pub fn fail_audio(&self, errors: impl IntoIterator<Item = ChatError>) {
        self.audio_errors.lock().extend(errors);
    }

    /// Everything recorded so far
    #[must_use]
    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: ChatCall) {
        self.calls.lock().push(call);
    }

    fn next_message(&self, chat_id: i64) -> MessageRef {
        MessageRef::new(chat_id, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn text_failure(&self) -> Result<(), ChatError> {
        self.text_errors.lock().pop_front().map_or(Ok(()), Err)
    }

    async fn audio_failure(&self) -> Result<(), ChatError> {
        if let Some(gate) = &self.upload_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.audio_errors.lock().pop_front().map_or(Ok(()), Err)
    }

    fn ensure_exists(&self, message: MessageRef) -> Result<(), ChatError> {
        if self.deleted.lock().contains(&message) {
            Err(ChatError::MessageNotFound)
        } else {
            Ok(())
        }
    }
}

fn file_id_for(audio: &AudioUpload) -> String {
    match &audio.source {
        AudioSource::FileId(id) => id.clone(),
        AudioSource::File(_) => format!("uploaded-{}", audio.title),
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef, ChatError> {
        self.text_failure()?;
        self.record(ChatCall::SendMessage {
            chat_id,
            text: text.to_string(),
        });
        Ok(self.next_message(chat_id))
    }

    async fn edit_message_text(&self, message: MessageRef, text: &str) -> Result<(), ChatError> {
        self.text_failure()?;
        self.ensure_exists(message)?;
        self.record(ChatCall::EditText {
            message,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn edit_message_media(
        &self,
        message: MessageRef,
        audio: &AudioUpload,
    ) -> Result<DeliveredAudio, ChatError> {
        self.audio_failure().await?;
        self.ensure_exists(message)?;
        self.record(ChatCall::EditMedia {
            message,
            title: audio.title.clone(),
        });
        Ok(DeliveredAudio {
            message,
            file_id: Some(file_id_for(audio)),
        })
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), ChatError> {
        self.text_failure()?;
        if !self.deleted.lock().insert(message) {
            return Err(ChatError::MessageNotFound);
        }
        self.record(ChatCall::Delete { message });
        Ok(())
    }

    async fn send_audio(
        &self,
        chat_id: i64,
        audio: &AudioUpload,
    ) -> Result<DeliveredAudio, ChatError> {
        self.audio_failure().await?;
        self.record(ChatCall::SendAudio {
            chat_id,
            title: audio.title.clone(),
            source: audio.source.clone(),
        });
        Ok(DeliveredAudio {
            message: self.next_message(chat_id),
            file_id: Some(file_id_for(audio)),
        })
    }
}

/// Serve `body` as `audio/mpeg` to every request on a local port.
///
/// Returns the base URL; the server lives until the runtime stops.
pub async fn serve_audio(body: &'static [u8]) -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    Ok(format!("http://{addr}"))
}

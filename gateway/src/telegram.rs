//! Peer and message lookup against the chat platform.
//!
//! Thin raw-RPC helpers on top of an authenticated session: resolving a
//! channel into an input peer, fetching one specific message, and pulling
//! the document descriptor out of it. Everything here is per-request;
//! the only process-lifetime state is the cached main-channel link.

use std::sync::OnceLock;

use grammers_client::{Client, InvocationError};
use grammers_tl_types as tl;
use tracing::{debug, info};

use common::{FileInfo, FileLocation};

/// Lookup failure kinds surfaced to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("message carries no document media")]
    NoMedia,
    #[error("message {message_id} not found in channel {channel_id}")]
    MsgNotFound { channel_id: i64, message_id: i32 },
    #[error("channel {0} could not be resolved")]
    ChannelNotFound(i64),
    #[error("upstream rpc failure: {0}")]
    Rpc(#[from] InvocationError),
}

/// Fetch the full channel object for a bare 10-digit channel id.
async fn get_channel(client: &Client, channel_id: i64) -> Result<tl::types::Channel, LookupError> {
    let request = tl::functions::channels::GetChannels {
        id: vec![
            tl::types::InputChannel {
                channel_id,
                access_hash: 0,
            }
            .into(),
        ],
    };
    let chats = match client.invoke(&request).await? {
        tl::enums::messages::Chats::Chats(chats) => chats.chats,
        tl::enums::messages::Chats::Slice(slice) => slice.chats,
    };
    chats
        .into_iter()
        .find_map(|chat| match chat {
            tl::enums::Chat::Channel(channel) if channel.id == channel_id => Some(channel),
            _ => None,
        })
        .ok_or(LookupError::ChannelNotFound(channel_id))
}

/// Resolve a channel id into the input peer the message RPCs expect.
pub async fn resolve_channel(
    client: &Client,
    channel_id: i64,
) -> Result<tl::types::InputChannel, LookupError> {
    let channel = get_channel(client, channel_id).await?;
    Ok(tl::types::InputChannel {
        channel_id: channel.id,
        access_hash: channel.access_hash.unwrap_or_default(),
    })
}

/// Fetch a single message from a channel.
///
/// The RPC answers in one of three shapes; the first concrete message found
/// wins. Anything else means the message does not exist (or is a service
/// message we cannot stream from).
pub async fn fetch_message(
    client: &Client,
    channel_id: i64,
    message_id: i32,
) -> Result<tl::types::Message, LookupError> {
    let channel = resolve_channel(client, channel_id).await?;
    debug!(channel_id, message_id, "fetching channel message");

    let request = tl::functions::channels::GetMessages {
        channel: channel.into(),
        id: vec![tl::types::InputMessageId { id: message_id }.into()],
    };
    let messages = match client.invoke(&request).await? {
        tl::enums::messages::Messages::Messages(m) => m.messages,
        tl::enums::messages::Messages::Slice(m) => m.messages,
        tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
        tl::enums::messages::Messages::NotModified(_) => Vec::new(),
    };
    messages
        .into_iter()
        .find_map(|message| match message {
            tl::enums::Message::Message(message) => Some(message),
            _ => None,
        })
        .ok_or(LookupError::MsgNotFound {
            channel_id,
            message_id,
        })
}

/// Extract the canonical file descriptor from a fetched message.
///
/// Fails with [`LookupError::NoMedia`] unless the message carries a
/// document attachment.
pub fn extract_file(message: &tl::types::Message) -> Result<FileInfo, LookupError> {
    let media = match &message.media {
        Some(tl::enums::MessageMedia::Document(media)) => media,
        _ => return Err(LookupError::NoMedia),
    };
    let document = match &media.document {
        Some(tl::enums::Document::Document(document)) => document,
        _ => return Err(LookupError::NoMedia),
    };
    Ok(FileInfo {
        location: FileLocation {
            id: document.id,
            access_hash: document.access_hash,
            file_reference: document.file_reference.clone(),
        },
        size: document.size,
        mime_type: document.mime_type.clone(),
        file_name: file_name_from_attributes(&document.attributes),
    })
}

/// First filename attribute wins; a document without one is named after
/// its type tag.
fn file_name_from_attributes(attributes: &[tl::enums::DocumentAttribute]) -> String {
    attributes
        .iter()
        .find_map(|attribute| match attribute {
            tl::enums::DocumentAttribute::Filename(f) => Some(f.file_name.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "document".to_string())
}

// ============================================================================
// Main-channel link
// ============================================================================

/// Set once on the first successful resolve, then served from memory for
/// the rest of the process lifetime.
static MAIN_CHANNEL_LINK: OnceLock<String> = OnceLock::new();

/// Public link of the main channel, resolved lazily through the given
/// session. Returns `None` until a resolve succeeds (or when the channel
/// id is unset); failures are not cached.
pub async fn main_channel_link(client: &Client, channel_id: i64) -> Option<String> {
    if let Some(link) = MAIN_CHANNEL_LINK.get() {
        return Some(link.clone());
    }
    if channel_id == 0 {
        return None;
    }
    let channel = match get_channel(client, channel_id).await {
        Ok(channel) => channel,
        Err(error) => {
            debug!(channel_id, error = %error, "main channel resolve failed");
            return None;
        }
    };
    let username = channel.username?;
    let link = format!("https://t.me/{username}");
    info!(channel_id, link = %link, "resolved main channel link");
    let _ = MAIN_CHANNEL_LINK.set(link.clone());
    Some(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_prefers_filename_attribute() {
        let attributes = vec![tl::enums::DocumentAttribute::Filename(
            tl::types::DocumentAttributeFilename {
                file_name: "movie.mkv".to_string(),
            },
        )];
        assert_eq!(file_name_from_attributes(&attributes), "movie.mkv");
    }

    #[test]
    fn test_file_name_falls_back_to_type_tag() {
        assert_eq!(file_name_from_attributes(&[]), "document");
    }
}

//! Map grammers types to domain entities.
//!
//! Extracts Chat, Message, MediaRef and access tuples from grammers_client
//! tl types. No IO here; everything is a pure translation.

use crate::domain::{
    Chat, ChatKind, EntityKind, MediaAccessRef, MediaRef, MediaType, Message, MessageEntity,
};
use grammers_client::peer::Peer;
use grammers_client::tl;

/// Map a grammers Peer to domain ChatKind.
///
/// * `Peer::User` → Private or Bot.
/// * `Peer::Group` → Group or Supergroup (Supergroup when megagroup).
/// * `Peer::Channel` → Channel (broadcast).
pub fn chat_kind_from_peer(peer: &Peer) -> ChatKind {
    match peer {
        Peer::User(u) => {
            if u.is_bot() {
                ChatKind::Bot
            } else {
                ChatKind::Private
            }
        }
        Peer::Group(g) => {
            if g.is_megagroup() {
                ChatKind::Supergroup
            } else {
                ChatKind::Group
            }
        }
        Peer::Channel(_) => ChatKind::Channel,
    }
}

/// Build a domain Chat from dialog data. `top_message_id` is the dialog's
/// newest message id, used as the totals heuristic before scanning.
pub fn dialog_to_chat(
    id: i64,
    title: &str,
    username: Option<&str>,
    kind: ChatKind,
    top_message_id: Option<i32>,
) -> Chat {
    Chat {
        id,
        title: title.to_string(),
        username: username.map(String::from),
        kind,
        access_hash: None,
        top_message_id,
    }
}

/// Map a raw history message to the domain record. Service messages are
/// kept (logged for completeness) with the discriminator set; empty
/// placeholders are dropped.
pub fn message_to_domain(msg: &tl::enums::Message, chat_id: i64) -> Option<Message> {
    match msg {
        tl::enums::Message::Empty(_) => None,
        tl::enums::Message::Message(m) => {
            let media = m.media.as_ref().and_then(extract_media_ref);
            Some(Message {
                id: m.id,
                chat_id,
                date: m.date as i64,
                text: m.message.clone(),
                entities: m
                    .entities
                    .as_ref()
                    .map(|es| es.iter().map(entity_to_domain).collect())
                    .unwrap_or_default(),
                from_user_id: m.from_id.as_ref().and_then(peer_user_id),
                reply_to_msg_id: m.reply_to.as_ref().and_then(reply_to_id),
                service: false,
                media,
            })
        }
        tl::enums::Message::Service(s) => Some(Message {
            id: s.id,
            chat_id,
            date: s.date as i64,
            text: String::new(),
            entities: Vec::new(),
            from_user_id: s.from_id.as_ref().and_then(peer_user_id),
            reply_to_msg_id: s.reply_to.as_ref().and_then(reply_to_id),
            service: true,
            media: None,
        }),
    }
}

fn peer_user_id(peer: &tl::enums::Peer) -> Option<i64> {
    match peer {
        tl::enums::Peer::User(u) => Some(u.user_id),
        _ => None,
    }
}

fn reply_to_id(reply: &tl::enums::MessageReplyHeader) -> Option<i32> {
    match reply {
        tl::enums::MessageReplyHeader::Header(h) => h.reply_to_msg_id,
        _ => None,
    }
}

fn entity_to_domain(e: &tl::enums::MessageEntity) -> MessageEntity {
    use tl::enums::MessageEntity as Tl;
    let (kind, offset, length, url) = match e {
        Tl::Mention(m) => (EntityKind::Mention, m.offset, m.length, None),
        Tl::Url(u) => (EntityKind::Url, u.offset, u.length, None),
        Tl::TextUrl(t) => (EntityKind::TextLink, t.offset, t.length, Some(t.url.clone())),
        Tl::Bold(b) => (EntityKind::Bold, b.offset, b.length, None),
        Tl::Italic(i) => (EntityKind::Italic, i.offset, i.length, None),
        Tl::Code(c) => (EntityKind::Code, c.offset, c.length, None),
        Tl::Pre(p) => (EntityKind::Pre, p.offset, p.length, None),
        other => {
            let (offset, length) = entity_span(other);
            (EntityKind::Other, offset, length, None)
        }
    };
    MessageEntity {
        kind,
        offset,
        length,
        url,
    }
}

fn entity_span(e: &tl::enums::MessageEntity) -> (i32, i32) {
    use tl::enums::MessageEntity as Tl;
    match e {
        Tl::Unknown(x) => (x.offset, x.length),
        Tl::Hashtag(x) => (x.offset, x.length),
        Tl::BotCommand(x) => (x.offset, x.length),
        Tl::Email(x) => (x.offset, x.length),
        Tl::Underline(x) => (x.offset, x.length),
        Tl::Strike(x) => (x.offset, x.length),
        Tl::Blockquote(x) => (x.offset, x.length),
        Tl::Phone(x) => (x.offset, x.length),
        Tl::Cashtag(x) => (x.offset, x.length),
        Tl::BankCard(x) => (x.offset, x.length),
        Tl::Spoiler(x) => (x.offset, x.length),
        Tl::CustomEmoji(x) => (x.offset, x.length),
        Tl::MentionName(x) => (x.offset, x.length),
        Tl::InputMessageEntityMentionName(x) => (x.offset, x.length),
        _ => (0, 0),
    }
}

/// Extract a downloadable media reference with its access tuple. Returns
/// `None` for media kinds the engine does not transfer (polls, geo,
/// webpage previews without a photo, ...).
pub fn extract_media_ref(media: &tl::enums::MessageMedia) -> Option<MediaRef> {
    match media {
        tl::enums::MessageMedia::Photo(p) => photo_media_ref(p.photo.as_ref()?),
        tl::enums::MessageMedia::Document(d) => document_media_ref(d.document.as_ref()?),
        _ => None,
    }
}

fn photo_media_ref(photo: &tl::enums::Photo) -> Option<MediaRef> {
    let p = match photo {
        tl::enums::Photo::Photo(p) => p,
        tl::enums::Photo::Empty(_) => return None,
    };
    // Largest size wins; progressive sizes carry their byte counts in a
    // list whose last entry is the full download.
    let (thumb_size, size) = p
        .sizes
        .iter()
        .filter_map(photo_size)
        .max_by_key(|(_, size)| *size)?;
    Some(MediaRef {
        media_type: MediaType::Photo,
        size,
        file_name: None,
        access: MediaAccessRef::Photo {
            id: p.id,
            access_hash: p.access_hash,
            file_reference: p.file_reference.clone(),
            thumb_size,
        },
    })
}

fn photo_size(size: &tl::enums::PhotoSize) -> Option<(String, u64)> {
    match size {
        tl::enums::PhotoSize::Size(s) => Some((s.r#type.clone(), s.size as u64)),
        tl::enums::PhotoSize::Progressive(s) => {
            let max = s.sizes.iter().copied().max().unwrap_or(0);
            Some((s.r#type.clone(), max as u64))
        }
        _ => None,
    }
}

fn document_media_ref(document: &tl::enums::Document) -> Option<MediaRef> {
    let d = match document {
        tl::enums::Document::Document(d) => d,
        tl::enums::Document::Empty(_) => return None,
    };

    let mut media_type = classify_mime(&d.mime_type);
    let mut file_name = None;
    for attr in &d.attributes {
        match attr {
            tl::enums::DocumentAttribute::Filename(f) => {
                file_name = Some(f.file_name.clone());
            }
            tl::enums::DocumentAttribute::Video(v) => {
                media_type = if v.round_message {
                    MediaType::VideoNote
                } else {
                    MediaType::Video
                };
            }
            tl::enums::DocumentAttribute::Audio(a) => {
                media_type = if a.voice {
                    MediaType::Voice
                } else {
                    MediaType::Audio
                };
            }
            tl::enums::DocumentAttribute::Sticker(_) => {
                media_type = MediaType::Sticker;
            }
            tl::enums::DocumentAttribute::Animated(_) => {
                media_type = MediaType::Animation;
            }
            _ => {}
        }
    }

    Some(MediaRef {
        media_type,
        size: d.size.max(0) as u64,
        file_name,
        access: MediaAccessRef::Document {
            id: d.id,
            access_hash: d.access_hash,
            file_reference: d.file_reference.clone(),
        },
    })
}

fn classify_mime(mime: &str) -> MediaType {
    if mime.starts_with("video/") {
        MediaType::Video
    } else if mime.starts_with("audio/") {
        MediaType::Audio
    } else if mime == "application/x-tgsticker" || mime == "image/webp" {
        MediaType::Sticker
    } else if mime.starts_with("image/") {
        MediaType::Photo
    } else {
        MediaType::Document
    }
}

/// Build the wire location for `upload.getFile` from a stored access tuple.
pub fn input_file_location(access: &MediaAccessRef) -> tl::enums::InputFileLocation {
    match access {
        MediaAccessRef::Photo {
            id,
            access_hash,
            file_reference,
            thumb_size,
        } => tl::types::InputPhotoFileLocation {
            id: *id,
            access_hash: *access_hash,
            file_reference: file_reference.clone(),
            thumb_size: thumb_size.clone(),
        }
        .into(),
        MediaAccessRef::Document {
            id,
            access_hash,
            file_reference,
        } => tl::types::InputDocumentFileLocation {
            id: *id,
            access_hash: *access_hash,
            file_reference: file_reference.clone(),
            thumb_size: String::new(),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_classification() {
        assert_eq!(classify_mime("video/mp4"), MediaType::Video);
        assert_eq!(classify_mime("audio/ogg"), MediaType::Audio);
        assert_eq!(classify_mime("application/x-tgsticker"), MediaType::Sticker);
        assert_eq!(classify_mime("image/png"), MediaType::Photo);
        assert_eq!(classify_mime("application/zip"), MediaType::Document);
    }
}

//! Incoming-message dispatch on the default worker.
//!
//! The streaming core's bot surface is deliberately small: a user sends a
//! file, the bot forwards it into the backing channel, builds the watch
//! link from the forwarded copy and replies with it. Credits are debited
//! just before the link is composed and refunded if the reply cannot be
//! delivered, so a failed reply never costs the user anything. Command
//! traffic (/broadcast, /ban, ...) belongs to the admin subsystem and is
//! ignored here.

use std::sync::Arc;

use grammers_client::types::Media;
use grammers_client::{InputMessage, Update, button, reply_markup};
use grammers_session::{PackedChat, PackedType};
use tracing::{error, info, warn};

use common::{make_hash, readable_size};

use crate::state::AppState;
use crate::telegram;
use crate::users::CreditService;
use crate::workers::BotWorker;

/// Run the update loop on the default worker. Never returns under normal
/// operation; resolves only when no default worker exists.
pub async fn run_dispatcher(state: AppState, credits: Arc<dyn CreditService>) {
    let Some(worker) = state.pool.default_worker().cloned() else {
        warn!("no default worker, bot dispatch disabled");
        return;
    };

    announce_startup(&worker, state.cfg.admin_id).await;

    info!(username = %worker.username, "bot dispatch started");
    loop {
        match worker.client.next_update().await {
            Ok(Update::NewMessage(message)) if !message.outgoing() => {
                if let Err(error) = handle_message(&state, &credits, &worker, message).await {
                    warn!(error = %error, "failed to handle incoming message");
                }
            }
            Ok(_) => {}
            Err(error) => {
                error!(error = %error, "update stream failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Best-effort startup note to the admin.
async fn announce_startup(worker: &BotWorker, admin_id: i64) {
    if admin_id == 0 {
        return;
    }
    let admin = PackedChat {
        ty: PackedType::User,
        id: admin_id,
        access_hash: None,
    };
    if let Err(error) = worker.client.send_message(admin, "Bot is running").await {
        warn!(error = %error, "could not notify admin about startup");
    }
}

async fn handle_message(
    state: &AppState,
    credits: &Arc<dyn CreditService>,
    worker: &Arc<BotWorker>,
    message: grammers_client::types::Message,
) -> anyhow::Result<()> {
    // Only documents become stream links; everything else is command
    // traffic for the admin subsystem.
    if !matches!(message.media(), Some(Media::Document(_))) {
        return Ok(());
    }
    let Some(sender) = message.sender() else {
        return Ok(());
    };
    let user_id = sender.id();
    let cfg = &state.cfg;

    if cfg.ref_enabled {
        let balance = credits.credits(user_id).await.unwrap_or(0);
        if balance < cfg.min_credits_required {
            let refer_url = refer_link(&worker.username, user_id);
            let text = format!(
                "You're out of credits!\nYou need {} more credits to use this bot.\n\nRefer one user to earn {} credits.",
                cfg.min_credits_required - balance,
                cfg.increment_credits,
            );
            message
                .respond(InputMessage::text(text).reply_markup(&reply_markup::inline(vec![
                    vec![button::url("Get Credits By Refer", refer_url)],
                ])))
                .await?;
            return Ok(());
        }
    }

    // Forward into the backing channel, then build the link from the
    // forwarded copy: that is the exact message the stream handler will
    // fetch later, so the fingerprint is computed on identical fields.
    let channel = telegram::resolve_channel(&worker.client, cfg.db_channel_id).await?;
    let db_channel = PackedChat {
        ty: PackedType::Broadcast,
        id: cfg.db_channel_id,
        access_hash: Some(channel.access_hash),
    };
    let forwarded = message.forward_to(db_channel).await?;
    let channel_message =
        telegram::fetch_message(&worker.client, cfg.db_channel_id, forwarded.id()).await?;
    let file = telegram::extract_file(&channel_message)?;
    let hash = make_hash(&file);

    // Debit before the link goes out; refunded below if the reply fails.
    credits
        .decrement_credits(user_id, cfg.decrement_credits)
        .await?;

    let watch_link = format!("{}/watch/{}?hash={}", cfg.fqdn, forwarded.id(), hash);
    info!(user_id, message_id = forwarded.id(), link = %watch_link, "stream link created");

    let text = format!(
        "Your file is ready to watch or download!\n\nFile Name: {}\nFile Size: {}\n\nLink: {}",
        file.file_name,
        readable_size(file.size),
        watch_link,
    );
    let reply = InputMessage::text(text).reply_markup(&reply_markup::inline(vec![vec![
        button::url("Watch or Download", watch_link.clone()),
    ]]));

    if let Err(error) = message.respond(reply).await {
        warn!(user_id, error = %error, "reply failed, refunding credits");
        if let Err(refund_error) = credits
            .increment_credits(user_id, cfg.decrement_credits)
            .await
        {
            error!(user_id, error = %refund_error, "credit refund failed");
        }
        return Err(error.into());
    }
    Ok(())
}

/// Share-link a user can pass around to earn referral credits.
fn refer_link(bot_username: &str, user_id: i64) -> String {
    let refer_url = format!("https://t.me/{bot_username}?start=ref{user_id}");
    let share = format!(
        "https://t.me/share/url?url={refer_url}&text=Try this bot! Quickly stream or download your files with security and reliability."
    );
    share.replace(' ', "%20").replace('!', "%21")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refer_link_escapes_share_text() {
        let link = refer_link("stream_bot", 42);
        assert!(link.starts_with("https://t.me/share/url?url=https://t.me/stream_bot?start=ref42"));
        assert!(!link.contains(' '));
        assert!(!link.contains('!'));
        assert!(link.contains("%20"));
        assert!(link.contains("%21"));
    }
}

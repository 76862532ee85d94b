//! Bulk loading of a conversation and the lazy fetches that follow it.
//!
//! A load fetches messages and threads, then the attachments and reactions
//! of those messages, then any profiles they reference. The result is built
//! into a fresh [`Reconciler`] and swapped in, keeping whatever the change
//! feed or the user added while the fetch was in flight: new messages are
//! carried over, and attachment and reaction changes recorded in the load
//! journal are replayed on top. A load whose epoch has moved on by the time
//! a fetch returns is discarded.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::backend::BackendError;
use crate::ingest::{
    attachment_from_row, conversation_from_row, decode_rows, message_from_row, profile_from_row,
    reaction_from_row, thread_from_row,
};
use crate::logging::conv_id;
use crate::model::{
    Attachment, AttachmentId, ChatOverview, ConversationId, Message, MessageId, Profile,
    Reaction, Thread, ThreadId, UserId,
};
use crate::reconciler::Reconciler;
use crate::session::{SessionEvent, SessionShared, SharedSession, SyncError};

struct ConversationRows {
    messages: Vec<Message>,
    threads: Vec<Thread>,
    attachments: Vec<Attachment>,
    reactions: Vec<Reaction>,
    profiles: Vec<Profile>,
}

/// Run a bulk load for the conversation open under `epoch`. Returns the
/// number of messages afterwards.
pub(crate) async fn load_conversation(shared: &SharedSession, epoch: u64) -> Result<usize, SyncError> {
    let (conversation_id, before_messages, before_threads, known_profiles, cursor) = {
        let mut st = shared.state.lock().await;
        let rec = st.active(epoch).ok_or(SyncError::Superseded)?;
        let messages: HashSet<MessageId> = rec.messages().iter().map(|m| m.id.clone()).collect();
        let threads: HashSet<ThreadId> = rec.threads().iter().map(|t| t.id.clone()).collect();
        let profiles: HashSet<UserId> = rec.profiles().map(|p| p.id.clone()).collect();
        let conversation_id = rec.conversation_id().clone();
        let cursor = st.journal.begin();
        (conversation_id, messages, threads, profiles, cursor)
    };
    tracing::info!("loader: loading {}", conv_id(conversation_id.as_str()));

    let rows = match fetch_rows(shared, epoch, &conversation_id, &known_profiles).await {
        Ok(rows) => rows,
        Err(e) => {
            let mut st = shared.state.lock().await;
            if st.epoch == epoch {
                st.journal.finish(cursor);
            }
            return Err(e);
        }
    };

    let (count, bare_media, to_sign) = {
        let mut guard = shared.state.lock().await;
        let st = &mut *guard;
        if st.epoch != epoch {
            return Err(SyncError::Superseded);
        }
        let replay = st.journal.finish(cursor);
        let current = st.conversation.as_ref().ok_or(SyncError::Superseded)?;
        let mut fresh = merge_load(current, rows, &before_messages, &before_threads);
        if !replay.is_empty() {
            tracing::debug!(
                "loader: replaying {} change(s) made while {} was loading",
                replay.len(),
                conv_id(conversation_id.as_str())
            );
        }
        for change in replay {
            change.apply(&mut fresh);
        }

        let ids: Vec<MessageId> = fresh.messages().iter().map(|m| m.id.clone()).collect();
        for pending in st.pending.drain_for(&ids) {
            pending.apply(&mut fresh);
        }

        let count = fresh.messages().len();
        let bare_media: Vec<MessageId> = fresh
            .messages()
            .iter()
            .filter(|m| fresh.is_missing_media(&m.id))
            .map(|m| m.id.clone())
            .collect();
        let to_sign: Vec<Attachment> = fresh.all_attachments().cloned().collect();
        st.signed_urls.retain(|id, _| fresh.attachment(id).is_some());
        st.conversation = Some(fresh);

        shared.publish_change(st);
        shared.emit(SessionEvent::Loaded {
            conversation_id: conversation_id.clone(),
            message_count: count,
        });
        for id in &bare_media {
            shared.hydration.schedule(shared, epoch, id.clone());
        }
        (count, bare_media, to_sign)
    };
    tracing::info!(
        "loader: {} message(s) for {} ({} awaiting media)",
        count,
        conv_id(conversation_id.as_str()),
        bare_media.len()
    );

    sign_attachments(shared, epoch, to_sign).await;
    Ok(count)
}

/// Fetch every row of a conversation, checking between steps that the load
/// is still wanted.
async fn fetch_rows(
    shared: &SharedSession,
    epoch: u64,
    conversation_id: &ConversationId,
    known_profiles: &HashSet<UserId>,
) -> Result<ConversationRows, SyncError> {
    let (message_rows, thread_rows) = tokio::try_join!(
        shared.backend.fetch_messages(conversation_id),
        shared.backend.fetch_threads(conversation_id)
    )?;
    let messages = decode_rows(&message_rows, message_from_row);
    let threads = decode_rows(&thread_rows, thread_from_row);
    check_epoch(shared, epoch).await?;

    let ids: Vec<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
    let (attachment_rows, reaction_rows) = tokio::try_join!(
        shared.backend.fetch_attachments(&ids),
        shared.backend.fetch_reactions(&ids)
    )?;
    let attachments = decode_rows(&attachment_rows, attachment_from_row);
    let reactions = decode_rows(&reaction_rows, reaction_from_row);
    check_epoch(shared, epoch).await?;

    let mut wanted = BTreeSet::new();
    wanted.extend(messages.iter().map(|m| m.sender_id.clone()));
    wanted.extend(attachments.iter().map(|a| a.uploader_id.clone()));
    wanted.extend(reactions.iter().map(|r| r.user_id.clone()));
    wanted.retain(|id| !known_profiles.contains(id));
    let profiles = if wanted.is_empty() {
        Vec::new()
    } else {
        let wanted: Vec<UserId> = wanted.into_iter().collect();
        match shared.backend.fetch_profiles(&wanted).await {
            Ok(rows) => decode_rows(&rows, profile_from_row),
            Err(e) => {
                // Names fill in later; not worth failing the load over.
                tracing::warn!("loader: profile fetch failed: {}", e);
                Vec::new()
            }
        }
    };

    Ok(ConversationRows {
        messages,
        threads,
        attachments,
        reactions,
        profiles,
    })
}

async fn check_epoch(shared: &SessionShared, epoch: u64) -> Result<(), SyncError> {
    let st = shared.state.lock().await;
    match st.active(epoch) {
        Some(_) => Ok(()),
        None => Err(SyncError::Superseded),
    }
}

/// Build the post-load state: server rows first, then rows that showed up
/// locally while the fetch was running. Messages removed locally during the
/// fetch stay removed.
fn merge_load(
    current: &Reconciler,
    rows: ConversationRows,
    before_messages: &HashSet<MessageId>,
    before_threads: &HashSet<ThreadId>,
) -> Reconciler {
    let mut fresh = Reconciler::new(current.conversation_id().clone());

    for profile in current.profiles() {
        fresh.upsert_profile(profile.clone());
    }
    for profile in rows.profiles {
        fresh.upsert_profile(profile);
    }

    for thread in rows.threads {
        let removed_meanwhile =
            before_threads.contains(&thread.id) && current.thread(&thread.id).is_none();
        if !removed_meanwhile {
            fresh.upsert_thread(thread);
        }
    }
    for thread in current.threads() {
        if !before_threads.contains(&thread.id) && fresh.thread(&thread.id).is_none() {
            fresh.upsert_thread(thread.clone());
        }
    }

    for message in rows.messages {
        let removed_meanwhile =
            before_messages.contains(&message.id) && !current.has_message(&message.id);
        if !removed_meanwhile {
            fresh.upsert_message(message);
        }
    }
    for attachment in rows.attachments {
        fresh.upsert_attachment(attachment);
    }
    for reaction in rows.reactions {
        fresh.upsert_reaction(reaction);
    }

    for message in current.messages() {
        if before_messages.contains(&message.id) || fresh.has_message(&message.id) {
            continue;
        }
        fresh.upsert_message(message.clone());
        for attachment in current.attachments_for(&message.id) {
            fresh.upsert_attachment(attachment.clone());
        }
        for reaction in current.reactions_for(&message.id) {
            fresh.upsert_reaction(reaction.clone());
        }
    }

    fresh.set_active_thread(current.active_thread().cloned());
    fresh.set_replying_to(current.replying_to().cloned());
    fresh
}

/// Fetch profiles for `users` and add them to the open conversation.
/// Profiles already known are skipped unless `force` is set.
pub(crate) async fn ensure_profiles(
    shared: &SharedSession,
    epoch: u64,
    mut users: Vec<UserId>,
    force: bool,
) -> Result<Vec<Profile>, BackendError> {
    if !force {
        let st = shared.state.lock().await;
        if let Some(rec) = st.active(epoch) {
            users.retain(|id| !rec.has_profile(id));
        }
    }
    users.sort();
    users.dedup();
    if users.is_empty() {
        return Ok(Vec::new());
    }

    let rows = shared.backend.fetch_profiles(&users).await?;
    let profiles = decode_rows(&rows, profile_from_row);

    let mut st = shared.state.lock().await;
    if let Some(rec) = st.active_mut(epoch) {
        for profile in &profiles {
            rec.upsert_profile(profile.clone());
        }
        if !profiles.is_empty() {
            shared.publish_change(&st);
        }
    }
    Ok(profiles)
}

/// Sign URLs for `attachments` and record them in the session's URL map.
/// One attachment is signed on its own; more are signed per bucket in a
/// single batch call. Failures leave the attachments unsigned.
pub(crate) async fn sign_attachments(shared: &SharedSession, epoch: u64, attachments: Vec<Attachment>) {
    if attachments.is_empty() {
        return;
    }
    let ttl = shared.config.signed_url_ttl_secs;
    let mut signed: Vec<(AttachmentId, String)> = Vec::new();

    if let [attachment] = attachments.as_slice() {
        match shared.storage.create_signed_url(&attachment.location, ttl).await {
            Ok(url) => signed.push((attachment.id.clone(), url)),
            Err(e) => tracing::warn!("loader: signing {} failed: {}", attachment.location.path, e),
        }
    } else {
        let mut by_bucket: BTreeMap<String, HashMap<String, Vec<AttachmentId>>> = BTreeMap::new();
        for attachment in &attachments {
            by_bucket
                .entry(attachment.location.bucket.clone())
                .or_default()
                .entry(attachment.location.path.clone())
                .or_default()
                .push(attachment.id.clone());
        }
        for (bucket, paths) in by_bucket {
            let path_list: Vec<String> = paths.keys().cloned().collect();
            match shared.storage.create_signed_urls(&bucket, &path_list, ttl).await {
                Ok(urls) => {
                    for (path, url) in urls {
                        for id in paths.get(&path).into_iter().flatten() {
                            signed.push((id.clone(), url.clone()));
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    "loader: signing {} path(s) in {} failed: {}",
                    path_list.len(),
                    bucket,
                    e
                ),
            }
        }
    }

    if signed.is_empty() {
        return;
    }
    let mut guard = shared.state.lock().await;
    let st = &mut *guard;
    if st.epoch != epoch {
        return;
    }
    let Some(rec) = st.conversation.as_ref() else {
        return;
    };
    let mut added = 0;
    for (id, url) in signed {
        if rec.attachment(&id).is_some() {
            st.signed_urls.insert(id, url);
            added += 1;
        }
    }
    if added > 0 {
        shared.notify_change(st);
    }
}

/// Fetch the user's conversation list and roster, and cache it.
pub(crate) async fn load_overview(shared: &SharedSession) -> Result<ChatOverview, SyncError> {
    let value = shared.backend.fetch_overview(shared.me()).await?;
    let rows = |field: &str| -> Vec<Value> {
        value
            .get(field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let overview = ChatOverview {
        conversations: decode_rows(&rows("conversations"), conversation_from_row),
        roster: decode_rows(&rows("roster"), profile_from_row),
    };
    shared.cache.schedule_overview_write(shared.me(), &overview);
    tracing::debug!(
        "loader: overview has {} conversation(s), {} roster entries",
        overview.conversations.len(),
        overview.roster.len()
    );
    Ok(overview)
}

mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{is_free, validate_interval};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Channel, NotifyHub};
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;
pub type SharedInbox = Arc<RwLock<Inbox>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first Append, drains whatever else is already queued,
/// then pays for a single fsync and answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // A compaction queued behind appends must see them on disk first.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    // All-or-nothing: a failed batch leaves no bytes behind for the next one.
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The scheduling core: every provider's calendar and waiting list, the service
/// catalog, and every user's inbox, all rebuilt from the WAL at startup.
pub struct Engine {
    pub(super) providers: DashMap<Ulid, SharedProviderState>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) inboxes: DashMap<Ulid, SharedInbox>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every mutation, taken exclusively by compaction so the
    /// snapshot and the WAL swap see no write in flight.
    pub(super) write_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment / waiting entry id → provider id.
    pub(super) entity_to_provider: DashMap<Ulid, Ulid>,
    /// Reverse lookup: notification id → user id.
    pub(super) notification_owner: DashMap<Ulid, Ulid>,
}

/// Apply the provider side of an event (caller holds the write lock).
fn apply_to_provider(ps: &mut ProviderState, event: &Event, entities: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AppointmentConfirmed {
            id,
            provider_id,
            customer_id,
            service_id,
            span,
            utc_offset,
            created_at,
        } => {
            ps.insert_appointment(Appointment {
                id: *id,
                provider_id: *provider_id,
                customer_id: *customer_id,
                service_id: *service_id,
                span: *span,
                utc_offset: *utc_offset,
                status: AppointmentStatus::Confirmed,
                created_at: *created_at,
            });
            entities.insert(*id, *provider_id);
        }
        Event::AppointmentRestored(appointment) => {
            ps.insert_appointment(appointment.clone());
            entities.insert(appointment.id, appointment.provider_id);
        }
        Event::CustomerWaitlisted {
            id,
            user_id,
            provider_id,
            service_id,
            preferred_date,
            created_at,
        } => {
            ps.waiting.push(WaitingListEntry {
                id: *id,
                user_id: *user_id,
                provider_id: *provider_id,
                service_id: *service_id,
                preferred_date: *preferred_date,
                status: WaitingStatus::Waiting,
                created_at: *created_at,
            });
            entities.insert(*id, *provider_id);
        }
        Event::WaitingEntryRestored(entry) => {
            ps.waiting.push(entry.clone());
            entities.insert(entry.id, entry.provider_id);
        }
        Event::AppointmentCancelled { id, promotion, .. } => {
            if let Some(appointment) = ps.appointment_mut(*id) {
                appointment.status = AppointmentStatus::Cancelled;
            }
            if let Some(p) = promotion
                && let Some(entry) = ps.waiting_mut(p.entry_id)
            {
                entry.status = WaitingStatus::Notified;
            }
        }
        Event::WaitingEntryRemoved { id, .. } => {
            ps.waiting.retain(|w| w.id != *id);
            entities.remove(id);
        }
        Event::WaitingListPurged { before, .. } => {
            ps.waiting.retain(|w| {
                let keep = w.status == WaitingStatus::Waiting && w.preferred_date >= *before;
                if !keep {
                    entities.remove(&w.id);
                }
                keep
            });
        }
        Event::CancelledAppointmentsCleared { .. } => {
            ps.appointments.retain(|a| {
                let keep = a.status != AppointmentStatus::Cancelled;
                if !keep {
                    entities.remove(&a.id);
                }
                keep
            });
        }
        Event::CustomerCancelledCleared { customer_id, .. } => {
            ps.appointments.retain(|a| {
                let keep = a.customer_id != *customer_id || a.status != AppointmentStatus::Cancelled;
                if !keep {
                    entities.remove(&a.id);
                }
                keep
            });
        }
        Event::ServiceRegistered { .. }
        | Event::NotificationPosted { .. }
        | Event::NotificationRead { .. }
        | Event::AllNotificationsRead { .. }
        | Event::ReadNotificationsCleared { .. }
        | Event::NotificationRestored(_) => return,
    }
    ps.version += 1;
}

/// Apply the inbox side of an event (caller holds the inbox write lock).
fn apply_to_inbox(inbox: &mut Inbox, event: &Event, owners: &DashMap<Ulid, Ulid>) {
    match event {
        Event::NotificationPosted {
            id,
            user_id,
            message,
            created_at,
        } => {
            inbox.notifications.push(Notification {
                id: *id,
                user_id: *user_id,
                message: message.clone(),
                is_read: false,
                created_at: *created_at,
            });
            owners.insert(*id, *user_id);
        }
        Event::NotificationRestored(notification) => {
            inbox.notifications.push(notification.clone());
            owners.insert(notification.id, notification.user_id);
        }
        Event::AppointmentCancelled {
            promotion: Some(p), ..
        } => {
            inbox.notifications.push(Notification {
                id: p.notification_id,
                user_id: p.user_id,
                message: p.message.clone(),
                is_read: false,
                created_at: p.created_at,
            });
            owners.insert(p.notification_id, p.user_id);
        }
        Event::NotificationRead { id, .. } => {
            if let Some(n) = inbox.notifications.iter_mut().find(|n| n.id == *id) {
                n.is_read = true;
            }
        }
        Event::AllNotificationsRead { .. } => {
            for n in &mut inbox.notifications {
                n.is_read = true;
            }
        }
        Event::ReadNotificationsCleared { .. } => {
            inbox.notifications.retain(|n| {
                if n.is_read {
                    owners.remove(&n.id);
                }
                !n.is_read
            });
        }
        _ => {}
    }
}

/// Provider whose calendar or waiting list an event touches.
fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AppointmentConfirmed { provider_id, .. }
        | Event::CustomerWaitlisted { provider_id, .. }
        | Event::AppointmentCancelled { provider_id, .. }
        | Event::WaitingEntryRemoved { provider_id, .. }
        | Event::WaitingListPurged { provider_id, .. }
        | Event::CancelledAppointmentsCleared { provider_id }
        | Event::CustomerCancelledCleared { provider_id, .. } => Some(*provider_id),
        Event::AppointmentRestored(a) => Some(a.provider_id),
        Event::WaitingEntryRestored(w) => Some(w.provider_id),
        Event::ServiceRegistered { .. }
        | Event::NotificationPosted { .. }
        | Event::NotificationRead { .. }
        | Event::AllNotificationsRead { .. }
        | Event::ReadNotificationsCleared { .. }
        | Event::NotificationRestored(_) => None,
    }
}

/// User whose inbox an event touches.
fn event_inbox_user(event: &Event) -> Option<Ulid> {
    match event {
        Event::NotificationPosted { user_id, .. }
        | Event::NotificationRead { user_id, .. }
        | Event::AllNotificationsRead { user_id }
        | Event::ReadNotificationsCleared { user_id } => Some(*user_id),
        Event::NotificationRestored(n) => Some(n.user_id),
        Event::AppointmentCancelled {
            promotion: Some(p), ..
        } => Some(p.user_id),
        _ => None,
    }
}

fn replay_contended(_: tokio::sync::TryLockError) -> io::Error {
    io::Error::other("state locked during WAL replay")
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            providers: DashMap::new(),
            services: DashMap::new(),
            inboxes: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            notify,
            entity_to_provider: DashMap::new(),
            notification_owner: DashMap::new(),
        };

        // We're the sole owner of every lock during replay, so try_write only fails
        // on a bug. Never use blocking_write here: this may run inside a runtime.
        for event in &events {
            if let Event::ServiceRegistered { .. } = event {
                engine.apply_service(event);
                continue;
            }
            if let Some(provider_id) = event_provider_id(event) {
                let ps = engine.provider(provider_id);
                let mut guard = ps.try_write().map_err(replay_contended)?;
                apply_to_provider(&mut guard, event, &engine.entity_to_provider);
            }
            if let Some(user_id) = event_inbox_user(event) {
                let inbox = engine.inbox(user_id);
                let mut guard = inbox.try_write().map_err(replay_contended)?;
                apply_to_inbox(&mut guard, event, &engine.notification_owner);
            }
        }

        tracing::info!(
            "replayed {} events: {} providers, {} services, {} inboxes",
            events.len(),
            engine.providers.len(),
            engine.services.len(),
            engine.inboxes.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))
    }

    /// Get or lazily create a provider's schedule.
    pub(super) fn provider(&self, id: Ulid) -> SharedProviderState {
        self.providers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderState::new(id))))
            .clone()
    }

    pub(super) fn inbox(&self, user_id: Ulid) -> SharedInbox {
        self.inboxes
            .entry(user_id)
            .or_insert_with(|| Arc::new(RwLock::new(Inbox::new(user_id))))
            .clone()
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_inbox(&self, user_id: &Ulid) -> Option<SharedInbox> {
        self.inboxes.get(user_id).map(|e| e.value().clone())
    }

    fn apply_service(&self, event: &Event) {
        if let Event::ServiceRegistered {
            id,
            provider_id,
            name,
            duration_minutes,
            price_cents,
        } = event
        {
            self.services.insert(
                *id,
                Service {
                    id: *id,
                    provider_id: *provider_id,
                    name: name.clone(),
                    duration_minutes: *duration_minutes,
                    price_cents: *price_cents,
                },
            );
            self.provider(*provider_id);
        }
    }

    /// Fan an applied event out to the provider and inbox feeds it touches.
    fn publish(&self, event: &Event) {
        if let Some(provider_id) = event_provider_id(event) {
            self.notify.send(Channel::Provider(provider_id), event);
        }
        if let Some(user_id) = event_inbox_user(event) {
            self.notify.send(Channel::Inbox(user_id), event);
        }
    }

    /// WAL-append, apply to whichever locked state the event touches, publish.
    /// Nothing is applied unless the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        ps: Option<&mut ProviderState>,
        inbox: Option<&mut Inbox>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        if let Some(ps) = ps {
            apply_to_provider(ps, event, &self.entity_to_provider);
        }
        if let Some(inbox) = inbox {
            apply_to_inbox(inbox, event, &self.notification_owner);
        }
        self.publish(event);
        Ok(())
    }

    /// Lookup entity → provider, get provider, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ProviderState>), EngineError> {
        let provider_id = self
            .entity_to_provider
            .get(entity_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.write_owned().await;
        Ok((provider_id, guard))
    }
}

use chrono::{DateTime, FixedOffset, NaiveDate};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CANCELLATIONS_TOTAL};

use super::conflict::{is_free, now_ms, revalidate, validate_booking_span, validate_offset};
use super::{Engine, EngineError, SharedProviderState, WalCommand};

fn promotion_message(date: NaiveDate) -> String {
    format!("A slot opened up on {date}. You are first on the waiting list, book now to claim it.")
}

impl Engine {
    /// Add or update a service in the catalog. Creates the provider's schedule on first use.
    pub async fn register_service(
        &self,
        id: Ulid,
        provider_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if duration_minutes == 0 {
            return Err(EngineError::InvalidArgument("service duration must be positive"));
        }
        if duration_minutes as Ms * 60_000 > MAX_APPOINTMENT_DURATION_MS {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        if !self.services.contains_key(&id) && self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let _gate = self.write_gate.read().await;
        let event = Event::ServiceRegistered {
            id,
            provider_id,
            name,
            duration_minutes,
            price_cents,
        };
        self.wal_append(&event).await?;
        self.apply_service(&event);
        debug!("service {id} registered for provider {provider_id}");
        Ok(())
    }

    /// Confirm an appointment if the slot is free, otherwise put the customer on
    /// the provider's waiting list for that date.
    ///
    /// The check and the commit form a compare-and-swap over the provider's
    /// calendar: the verdict taken under the read lock is re-validated under the
    /// write lock whenever the calendar changed in between. A slot that was free
    /// at check time but taken at commit time yields [`EngineError::Conflict`],
    /// never a silent waitlist and never a double booking.
    pub async fn request_booking(
        &self,
        customer_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        start: DateTime<FixedOffset>,
    ) -> Result<BookingOutcome, EngineError> {
        let service = self
            .get_service(&service_id)
            .ok_or(EngineError::ServiceNotFound(service_id))?;
        if service.provider_id != provider_id {
            return Err(EngineError::ServiceProviderMismatch {
                service_id,
                provider_id,
            });
        }
        let start_ms = start.timestamp_millis();
        let utc_offset = start.offset().local_minus_utc();
        validate_offset(utc_offset)?;
        let span = validate_booking_span(start_ms, start_ms + service.duration_ms())?;

        let _gate = self.write_gate.read().await;
        let ps = self.provider(provider_id);

        // Pre-check under the read lock.
        let (available, seen_version) = {
            let guard = ps.read().await;
            (is_free(&guard, &span), guard.version)
        };

        let mut guard = ps.write().await;
        let free_now = match revalidate(&guard, &span, available, seen_version) {
            Ok(free) => free,
            Err(e) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "conflict").increment(1);
                info!("booking race lost on provider {provider_id}: {e}");
                return Err(e);
            }
        };

        let now = now_ms();
        if free_now {
            if guard.appointments.len() >= MAX_APPOINTMENTS_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("too many appointments on provider"));
            }
            let id = Ulid::new();
            let event = Event::AppointmentConfirmed {
                id,
                provider_id,
                customer_id,
                service_id,
                span,
                utc_offset,
                created_at: now,
            };
            self.persist_and_apply(Some(&mut *guard), None, &event).await?;
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "confirmed").increment(1);
            debug!("appointment {id} confirmed for provider {provider_id}");
            Ok(BookingOutcome::Confirmed {
                appointment_id: id,
                span,
            })
        } else {
            if guard.waiting.len() >= MAX_WAITING_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("waiting list full"));
            }
            let id = Ulid::new();
            let preferred_date = local_date(start_ms, utc_offset);
            let event = Event::CustomerWaitlisted {
                id,
                user_id: customer_id,
                provider_id,
                service_id,
                preferred_date,
                created_at: now,
            };
            self.persist_and_apply(Some(&mut *guard), None, &event).await?;
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "waitlisted").increment(1);
            debug!("customer {customer_id} waitlisted on provider {provider_id} for {preferred_date}");
            Ok(BookingOutcome::Waitlisted {
                entry_id: id,
                preferred_date,
            })
        }
    }

    /// Cancel a confirmed appointment and promote the earliest waiting entry for
    /// the freed date. The provider write lock is held for the whole cascade and
    /// the cancellation, promotion and notification are one WAL record.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<CancelOutcome, EngineError> {
        let _gate = self.write_gate.read().await;
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        let appointment = guard.appointment(id).ok_or(EngineError::NotFound(id))?;
        if appointment.status == AppointmentStatus::Cancelled {
            metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => "already_cancelled").increment(1);
            return Ok(CancelOutcome::AlreadyCancelled);
        }

        let cancel_date = appointment.local_date();
        let promotion = guard.first_waiting(cancel_date).map(|entry| Promotion {
            entry_id: entry.id,
            user_id: entry.user_id,
            notification_id: Ulid::new(),
            message: promotion_message(cancel_date),
            created_at: now_ms(),
        });

        let event = Event::AppointmentCancelled {
            id,
            provider_id,
            promotion: promotion.clone(),
        };

        let outcome = match promotion {
            Some(p) => {
                let inbox = self.inbox(p.user_id);
                let mut inbox_guard = inbox.write().await;
                self.persist_and_apply(Some(&mut *guard), Some(&mut *inbox_guard), &event)
                    .await?;
                info!(
                    "appointment {id} cancelled, promoted waiting entry {} for {cancel_date}",
                    p.entry_id
                );
                CancelOutcome::CancelledAndPromoted {
                    entry_id: p.entry_id,
                    user_id: p.user_id,
                    notification_id: p.notification_id,
                }
            }
            None => {
                self.persist_and_apply(Some(&mut *guard), None, &event).await?;
                info!("appointment {id} cancelled, nobody waiting for {cancel_date}");
                CancelOutcome::Cancelled
            }
        };
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => outcome.label()).increment(1);
        Ok(outcome)
    }

    pub async fn post_notification(&self, user_id: Ulid, message: String) -> Result<Ulid, EngineError> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(EngineError::LimitExceeded("message too long"));
        }
        let _gate = self.write_gate.read().await;
        let inbox = self.inbox(user_id);
        let mut guard = inbox.write().await;
        if guard.notifications.len() >= MAX_NOTIFICATIONS_PER_USER {
            return Err(EngineError::LimitExceeded("too many notifications"));
        }
        let id = Ulid::new();
        let event = Event::NotificationPosted {
            id,
            user_id,
            message,
            created_at: now_ms(),
        };
        self.persist_and_apply(None, Some(&mut *guard), &event).await?;
        Ok(id)
    }

    /// Marking an already-read notification is a no-op.
    pub async fn mark_notification_read(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let user_id = self
            .notification_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let inbox = self.get_inbox(&user_id).ok_or(EngineError::NotFound(id))?;
        let mut guard = inbox.write().await;
        let notification = guard
            .notifications
            .iter()
            .find(|n| n.id == id)
            .ok_or(EngineError::NotFound(id))?;
        if notification.is_read {
            return Ok(());
        }
        let event = Event::NotificationRead { id, user_id };
        self.persist_and_apply(None, Some(&mut *guard), &event).await
    }

    /// Returns how many notifications flipped to read.
    pub async fn mark_all_read(&self, user_id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(inbox) = self.get_inbox(&user_id) else {
            return Ok(0);
        };
        let mut guard = inbox.write().await;
        let unread = guard.unread_count();
        if unread == 0 {
            return Ok(0);
        }
        let event = Event::AllNotificationsRead { user_id };
        self.persist_and_apply(None, Some(&mut *guard), &event).await?;
        Ok(unread)
    }

    /// Delete every read notification of a user. Returns how many were removed.
    pub async fn clear_read_notifications(&self, user_id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(inbox) = self.get_inbox(&user_id) else {
            return Ok(0);
        };
        let mut guard = inbox.write().await;
        let read = guard.notifications.iter().filter(|n| n.is_read).count();
        if read == 0 {
            return Ok(0);
        }
        let event = Event::ReadNotificationsCleared { user_id };
        self.persist_and_apply(None, Some(&mut *guard), &event).await?;
        Ok(read)
    }

    /// A user leaving the waiting list.
    pub async fn remove_waiting_entry(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.waiting.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::WaitingEntryRemoved { id, provider_id };
        self.persist_and_apply(Some(&mut *guard), None, &event).await
    }

    /// Provider cleanup: drop notified entries and entries for dates before `today`.
    pub async fn purge_waiting_list(&self, provider_id: Ulid, today: NaiveDate) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(0);
        };
        let mut guard = ps.write().await;
        let stale = guard
            .waiting
            .iter()
            .filter(|w| w.status == WaitingStatus::Notified || w.preferred_date < today)
            .count();
        if stale == 0 {
            return Ok(0);
        }
        let event = Event::WaitingListPurged {
            provider_id,
            before: today,
        };
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        Ok(stale)
    }

    /// Delete a provider's cancelled appointments. Returns how many were removed.
    pub async fn clear_cancelled(&self, provider_id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(0);
        };
        let mut guard = ps.write().await;
        let cancelled = guard
            .appointments
            .iter()
            .filter(|a| a.status == AppointmentStatus::Cancelled)
            .count();
        if cancelled == 0 {
            return Ok(0);
        }
        let event = Event::CancelledAppointmentsCleared { provider_id };
        self.persist_and_apply(Some(&mut *guard), None, &event).await?;
        Ok(cancelled)
    }

    /// Delete one customer's cancelled appointments across every provider.
    /// Each affected provider gets its own event, so a failure part way
    /// leaves the calendars already cleared as they are.
    pub async fn clear_cancelled_for_customer(&self, customer_id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let providers: Vec<(Ulid, SharedProviderState)> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut cleared = 0;
        for (provider_id, ps) in providers {
            let mut guard = ps.write().await;
            let cancelled = guard
                .appointments
                .iter()
                .filter(|a| a.customer_id == customer_id && a.status == AppointmentStatus::Cancelled)
                .count();
            if cancelled == 0 {
                continue;
            }
            let event = Event::CustomerCancelledCleared {
                provider_id,
                customer_id,
            };
            self.persist_and_apply(Some(&mut *guard), None, &event).await?;
            cleared += cancelled;
        }
        debug!(%customer_id, cleared, "cleared customer's cancelled appointments");
        Ok(cleared)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        for entry in self.services.iter() {
            let s = entry.value();
            events.push(Event::ServiceRegistered {
                id: s.id,
                provider_id: s.provider_id,
                name: s.name.clone(),
                duration_minutes: s.duration_minutes,
                price_cents: s.price_cents,
            });
        }

        let providers: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        for ps in providers {
            let guard = ps.read().await;
            events.extend(guard.appointments.iter().cloned().map(Event::AppointmentRestored));
            events.extend(guard.waiting.iter().cloned().map(Event::WaitingEntryRestored));
        }

        let inboxes: Vec<_> = self.inboxes.iter().map(|e| e.value().clone()).collect();
        for inbox in &inboxes {
            let guard = inbox.read().await;
            events.extend(guard.notifications.iter().cloned().map(Event::NotificationRestored));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?;
        info!("WAL compacted to {count} events ({} inboxes)", inboxes.len());
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

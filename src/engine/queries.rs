use chrono::{DateTime, FixedOffset};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{is_free, validate_booking_span, validate_interval};
use super::{Engine, EngineError, SharedProviderState};

impl Engine {
    /// True iff no confirmed appointment of the provider overlaps `[start, end)`.
    /// A provider with no schedule has nothing booked, so everything is free.
    pub async fn is_available(&self, provider_id: Ulid, start: Ms, end: Ms) -> Result<bool, EngineError> {
        let span = validate_interval(start, end)?;
        let Some(ps) = self.get_provider(&provider_id) else {
            return Ok(true);
        };
        let guard = ps.read().await;
        Ok(is_free(&guard, &span))
    }

    /// Availability of a service's slot starting at `start`. Advisory only: the
    /// verdict may be stale by the time a booking for the same slot commits.
    pub async fn check_availability(
        &self,
        provider_id: Ulid,
        service_id: Ulid,
        start: DateTime<FixedOffset>,
    ) -> Result<bool, EngineError> {
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
        let span = validate_booking_span(start_ms, start_ms + service.duration_ms())?;
        self.is_available(provider_id, span.start, span.end).await
    }

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// A provider's catalog, ordered by name.
    pub fn list_services(&self, provider_id: &Ulid) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|e| e.value().provider_id == *provider_id)
            .map(|e| e.value().clone())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        services
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        let provider_id = *self.entity_to_provider.get(id)?.value();
        let ps = self.get_provider(&provider_id)?;
        let guard = ps.read().await;
        guard.appointment(*id).cloned()
    }

    /// Every appointment of a provider, any status, ordered by start time.
    pub async fn get_appointments(&self, provider_id: &Ulid) -> Vec<Appointment> {
        match self.get_provider(provider_id) {
            Some(ps) => ps.read().await.appointments.clone(),
            None => Vec::new(),
        }
    }

    /// A customer's appointment history across providers, most recent start first.
    pub async fn get_customer_appointments(&self, customer_id: &Ulid) -> Vec<Appointment> {
        let providers: Vec<SharedProviderState> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::new();
        for ps in providers {
            let guard = ps.read().await;
            result.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.customer_id == *customer_id)
                    .cloned(),
            );
        }
        result.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(a.id.cmp(&b.id)));
        result
    }

    /// Waiting entries in FIFO order.
    pub async fn get_waiting_list(&self, provider_id: &Ulid) -> Vec<WaitingListEntry> {
        match self.get_provider(provider_id) {
            Some(ps) => ps.read().await.waiting.clone(),
            None => Vec::new(),
        }
    }

    /// Newest first.
    pub async fn get_notifications(&self, user_id: &Ulid) -> Vec<Notification> {
        let Some(inbox) = self.get_inbox(user_id) else {
            return Vec::new();
        };
        let guard = inbox.read().await;
        guard.notifications.iter().rev().cloned().collect()
    }

    /// Unread notifications of a user, counted from the rows on every call.
    pub async fn unread_count(&self, user_id: &Ulid) -> Result<usize, EngineError> {
        let Some(inbox) = self.get_inbox(user_id) else {
            return Ok(0);
        };
        let guard = inbox.read().await;
        Ok(guard.unread_count())
    }
}

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap: `[10:00, 10:30)` and `[10:30, 11:00)` are disjoint.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Calendar date of `at` as seen from a clock running at `utc_offset` seconds east of UTC.
pub fn local_date(at: Ms, utc_offset: i32) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(at + utc_offset as Ms * 1000)
        .unwrap_or_default()
        .date_naive()
}

/// RFC 3339 rendering of `at` in the given offset (falls back to UTC for invalid offsets).
pub fn format_instant(at: Ms, utc_offset: i32) -> String {
    let utc = DateTime::<Utc>::from_timestamp_millis(at).unwrap_or_default();
    match FixedOffset::east_opt(utc_offset) {
        Some(tz) => utc.with_timezone(&tz).to_rfc3339(),
        None => utc.to_rfc3339(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitingStatus {
    Waiting,
    Notified,
}

impl WaitingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitingStatus::Waiting => "waiting",
            WaitingStatus::Notified => "notified",
        }
    }
}

/// A bookable offering. Appointments copy the duration at booking time,
/// so editing a service never moves an existing appointment's end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: i64,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * 60_000
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    /// Offset (seconds east of UTC) the booking was requested in.
    pub utc_offset: i32,
    pub status: AppointmentStatus,
    pub created_at: Ms,
}

impl Appointment {
    pub fn is_confirmed(&self) -> bool {
        self.status == AppointmentStatus::Confirmed
    }

    /// Date portion of `start_time`, in the requester's offset.
    pub fn local_date(&self) -> NaiveDate {
        local_date(self.span.start, self.utc_offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingListEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub preferred_date: NaiveDate,
    pub status: WaitingStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub message: String,
    pub is_read: bool,
    pub created_at: Ms,
}

/// One provider's calendar plus its waiting list.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    /// Every appointment regardless of status, sorted by `span.start`.
    pub appointments: Vec<Appointment>,
    /// Waiting entries in creation order (FIFO).
    pub waiting: Vec<WaitingListEntry>,
    /// Bumped on every applied event; booking uses it to detect a lost race.
    pub version: u64,
}

impl ProviderState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            appointments: Vec::new(),
            waiting: Vec::new(),
            version: 0,
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments of any status whose span overlaps the query window.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// First confirmed appointment blocking `span`, if any.
    pub fn confirmed_conflict(&self, span: &Span) -> Option<&Appointment> {
        self.overlapping(span).find(|a| a.is_confirmed())
    }

    /// Earliest still-waiting entry for `date`.
    pub fn first_waiting(&self, date: NaiveDate) -> Option<&WaitingListEntry> {
        self.waiting
            .iter()
            .find(|w| w.status == WaitingStatus::Waiting && w.preferred_date == date)
    }

    pub fn waiting_mut(&mut self, id: Ulid) -> Option<&mut WaitingListEntry> {
        self.waiting.iter_mut().find(|w| w.id == id)
    }
}

/// One user's notifications in creation order.
#[derive(Debug, Clone)]
pub struct Inbox {
    pub user_id: Ulid,
    pub notifications: Vec<Notification>,
}

impl Inbox {
    pub fn new(user_id: Ulid) -> Self {
        Self {
            user_id,
            notifications: Vec::new(),
        }
    }

    /// Counted from the current rows every time; there is no cached counter to drift.
    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.is_read).count()
    }
}

/// A waiting entry promoted by a cancellation, with the notification sent to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub entry_id: Ulid,
    pub user_id: Ulid,
    pub notification_id: Ulid,
    pub message: String,
    pub created_at: Ms,
}

/// The event types. This is the WAL record format: every mutation is exactly one event,
/// so a cancellation and its promotion commit or fail together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        id: Ulid,
        provider_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    },
    AppointmentConfirmed {
        id: Ulid,
        provider_id: Ulid,
        customer_id: Ulid,
        service_id: Ulid,
        span: Span,
        utc_offset: i32,
        created_at: Ms,
    },
    CustomerWaitlisted {
        id: Ulid,
        user_id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        preferred_date: NaiveDate,
        created_at: Ms,
    },
    AppointmentCancelled {
        id: Ulid,
        provider_id: Ulid,
        promotion: Option<Promotion>,
    },
    NotificationPosted {
        id: Ulid,
        user_id: Ulid,
        message: String,
        created_at: Ms,
    },
    NotificationRead {
        id: Ulid,
        user_id: Ulid,
    },
    AllNotificationsRead {
        user_id: Ulid,
    },
    ReadNotificationsCleared {
        user_id: Ulid,
    },
    WaitingEntryRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    /// Drops notified entries and entries dated before `before`.
    WaitingListPurged {
        provider_id: Ulid,
        before: NaiveDate,
    },
    CancelledAppointmentsCleared {
        provider_id: Ulid,
    },
    /// One customer's cancelled rows on one provider's calendar.
    CustomerCancelledCleared {
        provider_id: Ulid,
        customer_id: Ulid,
    },
    // Snapshot records written by compaction.
    AppointmentRestored(Appointment),
    WaitingEntryRestored(WaitingListEntry),
    NotificationRestored(Notification),
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Confirmed { appointment_id: Ulid, span: Span },
    Waitlisted { entry_id: Ulid, preferred_date: NaiveDate },
}

impl BookingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BookingOutcome::Confirmed { .. } => "confirmed",
            BookingOutcome::Waitlisted { .. } => "waitlisted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    CancelledAndPromoted {
        entry_id: Ulid,
        user_id: Ulid,
        notification_id: Ulid,
    },
    /// The appointment was already cancelled; nothing changed.
    AlreadyCancelled,
}

impl CancelOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::CancelledAndPromoted { .. } => "cancelled_and_promoted",
            CancelOutcome::AlreadyCancelled => "already_cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn appt(start: Ms, end: Ms, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            provider_id: Ulid::nil(),
            customer_id: Ulid::new(),
            service_id: Ulid::new(),
            span: Span::new(start, end),
            utc_offset: 0,
            status,
            created_at: 0,
        }
    }

    fn waiting(date: NaiveDate, status: WaitingStatus) -> WaitingListEntry {
        WaitingListEntry {
            id: Ulid::new(),
            user_id: Ulid::new(),
            provider_id: Ulid::nil(),
            service_id: Ulid::new(),
            preferred_date: date,
            status,
            created_at: 0,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_duration() {
        assert_eq!(Span::new(100, 200).duration_ms(), 100);
    }

    #[test]
    fn local_date_respects_offset() {
        // 2026-03-01T22:30:00Z
        let at = 1_772_404_200_000;
        assert_eq!(local_date(at, 0), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        // Same instant is already March 2nd at UTC+3
        assert_eq!(local_date(at, 3 * 3600), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        // And still March 1st at UTC-5
        assert_eq!(local_date(at, -5 * 3600), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
    }

    #[test]
    fn format_instant_uses_offset() {
        let at = 1_772_404_200_000;
        assert_eq!(format_instant(at, 0), "2026-03-01T22:30:00+00:00");
        assert_eq!(format_instant(at, 3 * 3600), "2026-03-02T01:30:00+03:00");
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut ps = ProviderState::new(Ulid::new());
        ps.insert_appointment(appt(300, 400, AppointmentStatus::Confirmed));
        ps.insert_appointment(appt(100, 200, AppointmentStatus::Confirmed));
        ps.insert_appointment(appt(200, 300, AppointmentStatus::Cancelled));
        let starts: Vec<Ms> = ps.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut ps = ProviderState::new(Ulid::new());
        for i in 0..5 {
            ps.insert_appointment(appt(i * 100, i * 100 + 50, AppointmentStatus::Confirmed));
        }
        let hits: Vec<_> = ps.overlapping(&Span::new(120, 260)).collect();
        assert_eq!(hits.len(), 2); // [100,150) and [200,250)
        assert!(ps.overlapping(&Span::new(1000, 2000)).next().is_none());
        assert!(ps.overlapping(&Span::new(450, 500)).next().is_none());
    }

    #[test]
    fn confirmed_conflict_ignores_cancelled() {
        let mut ps = ProviderState::new(Ulid::new());
        ps.insert_appointment(appt(100, 200, AppointmentStatus::Cancelled));
        assert!(ps.confirmed_conflict(&Span::new(150, 250)).is_none());

        let live = appt(100, 200, AppointmentStatus::Confirmed);
        let live_id = live.id;
        ps.insert_appointment(live);
        assert_eq!(ps.confirmed_conflict(&Span::new(150, 250)).map(|a| a.id), Some(live_id));
    }

    #[test]
    fn first_waiting_is_fifo_and_skips_notified() {
        let d = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        let other = NaiveDate::from_ymd_opt(2026, 5, 5).unwrap();
        let mut ps = ProviderState::new(Ulid::new());
        ps.waiting.push(waiting(d, WaitingStatus::Notified));
        ps.waiting.push(waiting(other, WaitingStatus::Waiting));
        let first = waiting(d, WaitingStatus::Waiting);
        let first_id = first.id;
        ps.waiting.push(first);
        ps.waiting.push(waiting(d, WaitingStatus::Waiting));

        assert_eq!(ps.first_waiting(d).map(|w| w.id), Some(first_id));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::CustomerWaitlisted {
            id: Ulid::new(),
            user_id: Ulid::new(),
            provider_id: Ulid::new(),
            service_id: Ulid::new(),
            preferred_date: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            created_at: 42,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

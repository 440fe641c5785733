//! Calendar tools: availability lookup and meeting creation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::TransportError;
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

/// Working day bounds used when computing free slots.
const DAY_START_HOUR: u32 = 9;
const DAY_END_HOUR: u32 = 17;

/// A scheduled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarEvent {
    pub id: String,
    pub subject: String,
    pub attendees: Vec<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl CalendarEvent {
    fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.start < end && start < self.end
    }
}

/// A meeting the agent wants to book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingRequest {
    pub subject: String,
    pub attendees: Vec<String>,
    pub start: NaiveDateTime,
    pub duration: TimeDelta,
}

/// Calendar backend.
#[async_trait]
pub trait Calendar: Send + Sync {
    /// Free one-hour slots within working hours on `day`.
    async fn free_slots(&self, day: NaiveDate) -> Result<Vec<NaiveTime>, TransportError>;

    /// Book a meeting, returning the new event id.
    async fn create_event(&self, request: &MeetingRequest) -> Result<String, TransportError>;
}

/// Calendar held in process memory.
#[derive(Default)]
pub struct InMemoryCalendar {
    events: Mutex<Vec<CalendarEvent>>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<CalendarEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Calendar for InMemoryCalendar {
    async fn free_slots(&self, day: NaiveDate) -> Result<Vec<NaiveTime>, TransportError> {
        let events = self.events.lock().await;
        let slots = (DAY_START_HOUR..DAY_END_HOUR)
            .filter_map(|h| NaiveTime::from_hms_opt(h, 0, 0))
            .filter(|t| {
                let start = day.and_time(*t);
                let end = start + TimeDelta::hours(1);
                !events.iter().any(|e| e.overlaps(start, end))
            })
            .collect();
        Ok(slots)
    }

    async fn create_event(&self, request: &MeetingRequest) -> Result<String, TransportError> {
        let start = request.start;
        let end = start + request.duration;
        let mut events = self.events.lock().await;
        if let Some(clash) = events.iter().find(|e| e.overlaps(start, end)) {
            return Err(TransportError::Failed {
                service: "calendar".into(),
                reason: format!("conflicts with '{}' at {}", clash.subject, clash.start),
            });
        }
        let id = format!("evt-{}", uuid::Uuid::new_v4());
        events.push(CalendarEvent {
            id: id.clone(),
            subject: request.subject.clone(),
            attendees: request.attendees.clone(),
            start,
            end,
        });
        Ok(id)
    }
}

fn parse_day(tool: &str, raw: &str) -> Result<NaiveDate, ToolError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| ToolError::InvalidParameters {
        name: tool.to_string(),
        reason: format!("day '{raw}' is not YYYY-MM-DD: {e}"),
    })
}

// ── check_calendar ──────────────────────────────────────────────────

/// Lists free slots on a day. Safe.
pub struct CheckCalendarTool {
    calendar: Arc<dyn Calendar>,
}

impl CheckCalendarTool {
    pub const NAME: &'static str = "check_calendar";

    pub fn new(calendar: Arc<dyn Calendar>) -> Self {
        Self { calendar }
    }
}

#[async_trait]
impl Tool for CheckCalendarTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "List free one-hour slots on a given day (YYYY-MM-DD)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "day": {"type": "string", "description": "Date as YYYY-MM-DD"}
            },
            "required": ["day"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let day = parse_day(Self::NAME, require_str(Self::NAME, &params, "day")?)?;
        let slots = self
            .calendar
            .free_slots(day)
            .await
            .map_err(|e| e.into_tool_error(Self::NAME))?;

        let text = if slots.is_empty() {
            format!("No free slots on {day}")
        } else {
            let times: Vec<String> = slots.iter().map(|t| t.format("%H:%M").to_string()).collect();
            format!("Free on {day}: {}", times.join(", "))
        };
        Ok(ToolOutput::text(text, start.elapsed()))
    }
}

// ── schedule_meeting ────────────────────────────────────────────────

/// Books a meeting and invites attendees. Dangerous.
pub struct ScheduleMeetingTool {
    calendar: Arc<dyn Calendar>,
}

impl ScheduleMeetingTool {
    pub const NAME: &'static str = "schedule_meeting";

    pub fn new(calendar: Arc<dyn Calendar>) -> Self {
        Self { calendar }
    }
}

#[async_trait]
impl Tool for ScheduleMeetingTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Create a calendar event and send invitations to the attendees."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "attendees": {"type": "array", "items": {"type": "string"}},
                "subject": {"type": "string"},
                "day": {"type": "string", "description": "Date as YYYY-MM-DD"},
                "start_time": {"type": "string", "description": "24h time as HH:MM"},
                "duration_minutes": {"type": "integer"}
            },
            "required": ["attendees", "subject", "day", "start_time", "duration_minutes"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let invalid = |reason: String| ToolError::InvalidParameters {
            name: Self::NAME.to_string(),
            reason,
        };

        let subject = require_str(Self::NAME, &params, "subject")?;
        let day = parse_day(Self::NAME, require_str(Self::NAME, &params, "day")?)?;
        let raw_time = require_str(Self::NAME, &params, "start_time")?;
        let time = NaiveTime::parse_from_str(raw_time.trim(), "%H:%M")
            .map_err(|e| invalid(format!("start_time '{raw_time}' is not HH:MM: {e}")))?;
        let minutes = params
            .get("duration_minutes")
            .and_then(|v| v.as_i64())
            .filter(|m| *m > 0)
            .ok_or_else(|| invalid("duration_minutes must be a positive integer".into()))?;
        let attendees: Vec<String> = params
            .get("attendees")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if attendees.is_empty() {
            return Err(invalid("at least one attendee is required".into()));
        }

        let request = MeetingRequest {
            subject: subject.to_string(),
            attendees,
            start: day.and_time(time),
            duration: TimeDelta::minutes(minutes),
        };
        let id = self
            .calendar
            .create_event(&request)
            .await
            .map_err(|e| e.into_tool_error(Self::NAME))?;

        info!(event_id = %id, subject, attendees = request.attendees.len(), "Meeting scheduled");
        Ok(ToolOutput::text(
            format!(
                "Scheduled '{}' on {} at {} for {} minutes with {}",
                request.subject,
                day,
                time.format("%H:%M"),
                minutes,
                request.attendees.join(", ")
            ),
            started.elapsed(),
        ))
    }
}

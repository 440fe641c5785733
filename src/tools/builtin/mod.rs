//! Built-in email and calendar tools.

pub mod calendar;
pub mod email;

use std::sync::Arc;

pub use calendar::{Calendar, CheckCalendarTool, InMemoryCalendar, ScheduleMeetingTool};
pub use email::{
    DeleteEmailTool, DraftEmailReplyTool, ForwardEmailTool, Mailer, OutboxMailer, OutgoingEmail,
    SearchPastEmailsTool, SendEmailReplyTool, SmtpMailer,
};

use crate::store::traits::MemoryStore;
use crate::tools::registry::ToolRegistry;

/// Register every built-in tool against the given backends.
pub async fn register_builtin_tools(
    registry: &ToolRegistry,
    mailer: Arc<dyn Mailer>,
    calendar: Arc<dyn Calendar>,
    store: Arc<dyn MemoryStore>,
) {
    registry
        .register(Arc::new(SendEmailReplyTool::new(mailer.clone())))
        .await;
    registry
        .register(Arc::new(ForwardEmailTool::new(mailer.clone())))
        .await;
    registry.register(Arc::new(DeleteEmailTool::new(mailer))).await;
    registry.register(Arc::new(DraftEmailReplyTool)).await;
    registry
        .register(Arc::new(CheckCalendarTool::new(calendar.clone())))
        .await;
    registry
        .register(Arc::new(ScheduleMeetingTool::new(calendar)))
        .await;
    registry
        .register(Arc::new(SearchPastEmailsTool::new(store)))
        .await;
}

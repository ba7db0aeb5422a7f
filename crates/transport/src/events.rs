//! Events emitted by a DAP server
use serde::{Deserialize, Serialize, de::IgnoredAny};

use crate::message;
use crate::types::{BreakpointId, ThreadId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "body", rename_all = "camelCase")]
#[non_exhaustive]
pub enum Event {
    Initialized,
    Output(OutputEventBody),
    Process(ProcessEventBody),
    Stopped(StoppedEventBody),
    Continued(ContinuedEventBody),
    Thread(ThreadEventBody),
    Exited(ExitedEventBody),
    Terminated,
    // Catch-all for unknown event types - not part of serde tag/content
    #[serde(skip)]
    Unknown,
}

impl From<message::Event> for Event {
    fn from(event: message::Event) -> Self {
        let name = event.event.clone();
        let mut value = serde_json::json!({ "event": event.event });
        if let Some(body) = event.body {
            value["body"] = body;
        }

        match serde_json::from_value::<EventHelper>(value) {
            Ok(helper) => helper.into(),
            Err(e) => {
                tracing::debug!(event = %name, error = %e, "received unknown event, ignoring");
                Event::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "body", rename_all = "camelCase")]
enum EventHelper {
    Initialized,
    Output(OutputEventBody),
    Process(ProcessEventBody),
    Stopped(StoppedEventBody),
    Continued(ContinuedEventBody),
    Thread(ThreadEventBody),
    Exited(ExitedEventBody),
    /// The `restart` hint is not acted upon
    Terminated(Option<IgnoredAny>),
}

impl From<EventHelper> for Event {
    fn from(helper: EventHelper) -> Self {
        match helper {
            EventHelper::Initialized => Event::Initialized,
            EventHelper::Output(body) => Event::Output(body),
            EventHelper::Process(body) => Event::Process(body),
            EventHelper::Stopped(body) => Event::Stopped(body),
            EventHelper::Continued(body) => Event::Continued(body),
            EventHelper::Thread(body) => Event::Thread(body),
            EventHelper::Exited(body) => Event::Exited(body),
            EventHelper::Terminated(_) => Event::Terminated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEventBody {
    #[serde(default)]
    pub category: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
    #[serde(default)]
    pub hit_breakpoint_ids: Option<Vec<BreakpointId>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub all_threads_stopped: Option<bool>,
}

impl StoppedEventBody {
    pub fn is_exception(&self) -> bool {
        self.reason == "exception"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEventBody {
    pub reason: String,
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEventBody {
    pub name: String,
    #[serde(default)]
    pub system_process_id: Option<i64>,
    #[serde(default)]
    pub start_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    pub exit_code: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: ThreadId,
    #[serde(default)]
    pub all_threads_continued: Option<bool>,
}

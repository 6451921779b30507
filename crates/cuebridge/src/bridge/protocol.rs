//! Outbound event types and their mapping onto OSC messages.
//!
//! Events are produced by inbound handlers and by the engine's own threads,
//! queued, and converted to wire messages by the outbound pump. Each event
//! becomes exactly one message.

use chrono::{Datelike, NaiveDate};

use super::osc::{OscArg, OscMessage};

/// Outbound addresses understood by the GUI.
pub mod address {
    pub const EXITED: &str = "/exited";
    pub const EXITED_WITH_BOOT_ERROR: &str = "/exited-with-boot-error";
    pub const ACK: &str = "/ack";
    pub const INFO: &str = "/info";
    pub const SYNTAX_ERROR: &str = "/syntax_error";
    pub const ERROR: &str = "/error";
    pub const REPLACE_BUFFER: &str = "/replace-buffer";
    pub const REPLACE_LINES: &str = "/replace-lines";
    pub const MULTI_MESSAGE: &str = "/multi_message";
    pub const VERSION: &str = "/version";
}

const MISSING_BUFFER_CONTENT: &str =
    "Internal error within a fn calling replace-buffer without a content payload";
const MISSING_LINES_CONTENT: &str =
    "Internal error within a fn calling replace-lines without a content payload";

/// One entry of a multi-message: a message kind code plus its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiValue {
    pub kind: i32,
    pub text: String,
}

impl MultiValue {
    pub fn new(kind: i32, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Version details reported to the GUI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReport {
    pub version: String,
    pub version_num: i32,
    pub latest: String,
    pub latest_num: i32,
    pub last_checked: NaiveDate,
}

/// A state change to report to the GUI.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// Terminal event: the pump sends `/exited` and stops.
    Exit,

    BootError {
        reason: String,
    },

    /// Heartbeat acknowledgement echoing the request's opaque id.
    Ack {
        id: OscArg,
    },

    Info {
        text: String,
    },

    SyntaxError {
        job_id: i32,
        description: Option<String>,
        error_line: Option<String>,
        line: Option<i32>,
    },

    Error {
        job_id: i32,
        description: Option<String>,
        trace: Vec<String>,
        line: Option<i32>,
    },

    ReplaceBuffer {
        buffer_id: String,
        content: Option<String>,
        line: i32,
        index: i32,
        first_line: i32,
    },

    /// Replace a line range. Start defaults to the point line and finish to
    /// the start line when not given.
    ReplaceLines {
        buffer_id: String,
        content: Option<String>,
        start_line: Option<i32>,
        finish_line: Option<i32>,
        point_line: i32,
        point_index: i32,
    },

    MultiMessage {
        job_id: i32,
        thread_name: String,
        runtime: String,
        values: Vec<MultiValue>,
    },

    VersionInfo(VersionReport),
}

impl OutboundEvent {
    pub fn info(text: impl Into<String>) -> Self {
        Self::Info { text: text.into() }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::BootError { .. } => "boot_error",
            Self::Ack { .. } => "ack",
            Self::Info { .. } => "info",
            Self::SyntaxError { .. } => "syntax_error",
            Self::Error { .. } => "error",
            Self::ReplaceBuffer { .. } => "replace_buffer",
            Self::ReplaceLines { .. } => "replace_lines",
            Self::MultiMessage { .. } => "multi_message",
            Self::VersionInfo(_) => "version",
        }
    }

    pub fn into_message(self) -> OscMessage {
        match self {
            Self::Exit => OscMessage::bare(address::EXITED),
            Self::BootError { reason } => {
                OscMessage::new(address::EXITED_WITH_BOOT_ERROR, vec![reason.into()])
            }
            Self::Ack { id } => OscMessage::new(address::ACK, vec![id]),
            Self::Info { text } => OscMessage::new(address::INFO, vec![text.into()]),
            Self::SyntaxError {
                job_id,
                description,
                error_line,
                line,
            } => {
                let line = line.unwrap_or(-1);
                OscMessage::new(
                    address::SYNTAX_ERROR,
                    vec![
                        job_id.into(),
                        escape_html(description.as_deref().unwrap_or_default()).into(),
                        error_line.unwrap_or_default().into(),
                        line.into(),
                        line.to_string().into(),
                    ],
                )
            }
            Self::Error {
                job_id,
                description,
                trace,
                line,
            } => OscMessage::new(
                address::ERROR,
                vec![
                    job_id.into(),
                    escape_html(description.as_deref().unwrap_or_default()).into(),
                    escape_html(&trace.join("\n")).into(),
                    line.unwrap_or(-1).into(),
                ],
            ),
            Self::ReplaceBuffer {
                buffer_id,
                content,
                line,
                index,
                first_line,
            } => OscMessage::new(
                address::REPLACE_BUFFER,
                vec![
                    buffer_id.into(),
                    content
                        .unwrap_or_else(|| MISSING_BUFFER_CONTENT.to_string())
                        .into(),
                    line.into(),
                    index.into(),
                    first_line.into(),
                ],
            ),
            Self::ReplaceLines {
                buffer_id,
                content,
                start_line,
                finish_line,
                point_line,
                point_index,
            } => {
                let start_line = start_line.unwrap_or(point_line);
                let finish_line = finish_line.unwrap_or(start_line);
                OscMessage::new(
                    address::REPLACE_LINES,
                    vec![
                        buffer_id.into(),
                        content
                            .unwrap_or_else(|| MISSING_LINES_CONTENT.to_string())
                            .into(),
                        start_line.into(),
                        finish_line.into(),
                        point_line.into(),
                        point_index.into(),
                    ],
                )
            }
            Self::MultiMessage {
                job_id,
                thread_name,
                runtime,
                values,
            } => {
                let count = i32::try_from(values.len()).unwrap_or(i32::MAX);
                let mut args = Vec::with_capacity(4 + values.len() * 2);
                args.push(job_id.into());
                args.push(thread_name.into());
                args.push(runtime.into());
                args.push(count.into());
                for value in values {
                    args.push(value.kind.into());
                    args.push(value.text.into());
                }
                OscMessage::new(address::MULTI_MESSAGE, args)
            }
            Self::VersionInfo(report) => {
                let date = report.last_checked;
                OscMessage::new(
                    address::VERSION,
                    vec![
                        report.version.into(),
                        report.version_num.into(),
                        report.latest.into(),
                        report.latest_num.into(),
                        (date.day() as i32).into(),
                        (date.month() as i32).into(),
                        date.year().into(),
                    ],
                )
            }
        }
    }
}

/// Escape free text for display in the GUI's rich-text panes.
pub fn escape_html(text: &str) -> String {
    html_escape::encode_quoted_attribute(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_maps_to_bare_exited() {
        let msg = OutboundEvent::Exit.into_message();
        assert_eq!(msg, OscMessage::bare("/exited"));
    }

    #[test]
    fn ack_echoes_request_id() {
        let msg = OutboundEvent::Ack { id: "req42".into() }.into_message();
        assert_eq!(msg.address, "/ack");
        assert_eq!(msg.args, vec![OscArg::from("req42")]);
    }

    #[test]
    fn error_escapes_description_and_trace() {
        let msg = OutboundEvent::Error {
            job_id: 4,
            description: Some("<script>alert(1)</script>".to_string()),
            trace: vec!["a.rb:1 in <main>".to_string(), "b.rb:2".to_string()],
            line: Some(12),
        }
        .into_message();
        insta::assert_snapshot!(
            msg.to_string(),
            @r#"/error 4 "&lt;script&gt;alert(1)&lt;/script&gt;" "a.rb:1 in &lt;main&gt;\nb.rb:2" 12"#
        );
    }

    #[test]
    fn error_defaults_missing_fields() {
        let msg = OutboundEvent::Error {
            job_id: 1,
            description: None,
            trace: Vec::new(),
            line: None,
        }
        .into_message();
        assert_eq!(
            msg.args,
            vec![OscArg::Int(1), "".into(), "".into(), OscArg::Int(-1)]
        );
    }

    #[test]
    fn syntax_error_carries_stringified_line() {
        let msg = OutboundEvent::SyntaxError {
            job_id: 9,
            description: Some("unexpected \"end\" & more".to_string()),
            error_line: Some("end end".to_string()),
            line: Some(3),
        }
        .into_message();
        assert_eq!(msg.address, "/syntax_error");
        assert_eq!(
            msg.args,
            vec![
                OscArg::Int(9),
                "unexpected &quot;end&quot; &amp; more".into(),
                "end end".into(),
                OscArg::Int(3),
                "3".into(),
            ]
        );
    }

    #[test]
    fn replace_lines_defaults_range_to_point() {
        let msg = OutboundEvent::ReplaceLines {
            buffer_id: "workspace_zero".to_string(),
            content: Some("  play 60".to_string()),
            start_line: None,
            finish_line: None,
            point_line: 5,
            point_index: 2,
        }
        .into_message();
        insta::assert_snapshot!(
            msg.to_string(),
            @r#"/replace-lines "workspace_zero" "  play 60" 5 5 5 2"#
        );
    }

    #[test]
    fn replace_buffer_substitutes_missing_content() {
        let msg = OutboundEvent::ReplaceBuffer {
            buffer_id: "workspace_one".to_string(),
            content: None,
            line: 0,
            index: 0,
            first_line: 0,
        }
        .into_message();
        assert_eq!(msg.args[1], OscArg::from(MISSING_BUFFER_CONTENT));
    }

    #[test]
    fn multi_message_flattens_values() {
        let msg = OutboundEvent::MultiMessage {
            job_id: 2,
            thread_name: "live_loop_foo".to_string(),
            runtime: "12.5".to_string(),
            values: vec![MultiValue::new(0, "synth :beep"), MultiValue::new(1, "cue")],
        }
        .into_message();
        insta::assert_snapshot!(
            msg.to_string(),
            @r#"/multi_message 2 "live_loop_foo" "12.5" 2 0 "synth :beep" 1 "cue""#
        );
    }

    #[test]
    fn version_splits_check_date() {
        let msg = OutboundEvent::VersionInfo(VersionReport {
            version: "v2.10".to_string(),
            version_num: 210,
            latest: "v2.11".to_string(),
            latest_num: 211,
            last_checked: NaiveDate::from_ymd_opt(2016, 3, 14).unwrap(),
        })
        .into_message();
        insta::assert_snapshot!(msg.to_string(), @r#"/version "v2.10" 210 "v2.11" 211 14 3 2016"#);
    }

    #[test]
    fn boot_error_carries_reason() {
        let msg = OutboundEvent::BootError {
            reason: "port busy".to_string(),
        }
        .into_message();
        assert_eq!(msg.address, "/exited-with-boot-error");
        assert_eq!(msg.args, vec![OscArg::from("port busy")]);
    }
}

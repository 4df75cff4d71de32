//! JavaScript bridge requests.
//!
//! Web views hand the agent an action code plus a positional list of strings.
//! That list is decoded once, here, into a [`JsRequest`] with named fields;
//! nothing past this module deals with positional arguments.

use std::fmt::Display;
use crate::agent::AgentError;
use crate::event::JsBridgePayload;

/// Action requested from JavaScript. Numeric codes follow the bridge protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum JsAction {
    SendNow = 0,
    ReportBug = 1,
    ReportException = 2,
    AddMarker = 3,
    ReportJsError = 4,
}

impl TryFrom<u32> for JsAction {
    type Error = AgentError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(JsAction::SendNow),
            1 => Ok(JsAction::ReportBug),
            2 => Ok(JsAction::ReportException),
            3 => Ok(JsAction::AddMarker),
            4 => Ok(JsAction::ReportJsError),
            other => Err(AgentError::validation("js action", format!("unknown code {other}"))),
        }
    }
}

impl Display for JsAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JsAction::SendNow => "send_now",
            JsAction::ReportBug => "report_bug",
            JsAction::ReportException => "report_exception",
            JsAction::AddMarker => "add_marker",
            JsAction::ReportJsError => "report_js_error",
        };
        write!(f, "{name}")
    }
}

/// A decoded bridge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsRequest {
    SendNow,
    ReportBug {
        message: String,
    },
    ReportException {
        name: String,
        reason: String,
        stack: String,
    },
    AddMarker {
        message: String,
        file: String,
        class: String,
        method: String,
        line: u32,
    },
    ReportJsError {
        message: String,
        source: Option<String>,
        line: Option<u32>,
        column: Option<u32>,
        stack: Option<String>,
    },
}

/// Positional argument reader. Missing and empty optional arguments read as
/// `None`.
struct Args<'a> {
    action: JsAction,
    args: &'a [String],
}

impl<'a> Args<'a> {
    fn required(&self, index: usize, field: &'static str) -> Result<String, AgentError> {
        match self.optional(index) {
            Some(value) => Ok(value),
            None => Err(AgentError::validation(
                field,
                format!("missing argument {index} for {}", self.action),
            )),
        }
    }

    fn optional(&self, index: usize) -> Option<String> {
        self.args
            .get(index)
            .filter(|value| !value.is_empty())
            .cloned()
    }

    fn number(&self, index: usize, field: &'static str) -> Result<Option<u32>, AgentError> {
        match self.optional(index) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| AgentError::validation(field, format!("'{raw}' is not a line number"))),
        }
    }
}

impl JsRequest {
    /// Decodes `args` according to `action`.
    ///
    /// | action | arguments |
    /// |---|---|
    /// | SendNow | none |
    /// | ReportBug | message |
    /// | ReportException | name, reason, stack? |
    /// | AddMarker | message, file?, class?, method?, line? |
    /// | ReportJsError | message, source?, line?, column?, stack? |
    pub fn decode(action: JsAction, args: &[String]) -> Result<Self, AgentError> {
        let a = Args { action, args };

        let request = match action {
            JsAction::SendNow => JsRequest::SendNow,
            JsAction::ReportBug => JsRequest::ReportBug {
                message: a.required(0, "message")?,
            },
            JsAction::ReportException => JsRequest::ReportException {
                name: a.required(0, "exception name")?,
                reason: a.optional(1).unwrap_or_default(),
                stack: a.optional(2).unwrap_or_default(),
            },
            JsAction::AddMarker => JsRequest::AddMarker {
                message: a.required(0, "message")?,
                file: a.optional(1).unwrap_or_default(),
                class: a.optional(2).unwrap_or_default(),
                method: a.optional(3).unwrap_or_default(),
                line: a.number(4, "line")?.unwrap_or(0),
            },
            JsAction::ReportJsError => JsRequest::ReportJsError {
                message: a.required(0, "message")?,
                source: a.optional(1),
                line: a.number(2, "line")?,
                column: a.number(3, "column")?,
                stack: a.optional(4),
            },
        };

        Ok(request)
    }

    pub fn action(&self) -> JsAction {
        match self {
            JsRequest::SendNow => JsAction::SendNow,
            JsRequest::ReportBug { .. } => JsAction::ReportBug,
            JsRequest::ReportException { .. } => JsAction::ReportException,
            JsRequest::AddMarker { .. } => JsAction::AddMarker,
            JsRequest::ReportJsError { .. } => JsAction::ReportJsError,
        }
    }
}

/// Wire payload for a JavaScript error: the action name plus its five
/// arguments in protocol order, absent ones as empty strings.
pub fn js_error_payload(
    message: String,
    source: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    stack: Option<String>,
) -> JsBridgePayload {
    JsBridgePayload {
        action: JsAction::ReportJsError.to_string(),
        args: vec![
            message,
            source.unwrap_or_default(),
            line.map(|l| l.to_string()).unwrap_or_default(),
            column.map(|c| c.to_string()).unwrap_or_default(),
            stack.unwrap_or_default(),
        ],
    }
}

use serde::{Deserialize, Serialize};

pub mod meta;
pub mod netstring;
pub mod wire;

// Request kinds, response statuses and risk codes are fixed small integers
// on the wire; keep the numeric values stable.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Meta,
    Info,
    Risk,
    Echo,
}

impl RequestKind {
    pub fn code(self) -> u8 {
        match self {
            RequestKind::Meta => 0,
            RequestKind::Info => 1,
            RequestKind::Risk => 2,
            RequestKind::Echo => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RequestKind::Meta),
            1 => Some(RequestKind::Info),
            2 => Some(RequestKind::Risk),
            3 => Some(RequestKind::Echo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    BudgetExceeded,
    AccountantError,
    BadQuery,
    InternalError,
}

impl ResponseStatus {
    pub fn code(self) -> u8 {
        match self {
            ResponseStatus::Ok => 0,
            ResponseStatus::BudgetExceeded => 1,
            ResponseStatus::AccountantError => 2,
            ResponseStatus::BadQuery => 3,
            ResponseStatus::InternalError => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ResponseStatus::Ok),
            1 => Some(ResponseStatus::BudgetExceeded),
            2 => Some(ResponseStatus::AccountantError),
            3 => Some(ResponseStatus::BadQuery),
            4 => Some(ResponseStatus::InternalError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskQueryType {
    Check,
    Info,
}

impl RiskQueryType {
    pub fn code(self) -> u8 {
        match self {
            RiskQueryType::Check => 0,
            RiskQueryType::Info => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RiskQueryType::Check),
            1 => Some(RiskQueryType::Info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskResponseStatus {
    Ok,
    UserNotFound,
    BadQuery,
    InternalError,
}

impl RiskResponseStatus {
    pub fn code(self) -> u8 {
        match self {
            RiskResponseStatus::Ok => 0,
            RiskResponseStatus::UserNotFound => 1,
            RiskResponseStatus::BadQuery => 2,
            RiskResponseStatus::InternalError => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RiskResponseStatus::Ok),
            1 => Some(RiskResponseStatus::UserNotFound),
            2 => Some(RiskResponseStatus::BadQuery),
            3 => Some(RiskResponseStatus::InternalError),
            _ => None,
        }
    }
}

/// Authenticated sender identifier (a key fingerprint string).
pub type Identity = String;

/// A comparison value in a selection predicate or a processor parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub attribute: String,
    pub operator: String,
    pub value: Value,
}

/// One disjunct: a possibly negated conjunction of comparisons.
#[derive(Debug, Clone, PartialEq)]
pub struct Conjunction {
    pub negated: bool,
    pub terms: Vec<Comparison>,
}

/// Selection predicate: disjunction of conjunctions. Empty means "all rows".
pub type Predicate = Vec<Conjunction>;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPayload {
    pub dataset: String,
    pub predicate: Predicate,
    pub columns: Vec<String>,
    pub processor: String,
    pub parameters: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub alias: Option<Identity>,
    pub eps: f64,
    pub payload: Option<QueryPayload>,
}

impl Request {
    pub fn meta() -> Self {
        Request {
            kind: RequestKind::Meta,
            alias: None,
            eps: 0.0,
            payload: None,
        }
    }

    pub fn risk() -> Self {
        Request {
            kind: RequestKind::Risk,
            alias: None,
            eps: 0.0,
            payload: None,
        }
    }

    pub fn info(eps: f64, payload: QueryPayload) -> Self {
        Request {
            kind: RequestKind::Info,
            alias: None,
            eps,
            payload: Some(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: ResponseStatus,
    pub kind: Option<RequestKind>,
    pub payload: serde_json::Value,
}

impl Response {
    pub fn ok(kind: RequestKind, payload: serde_json::Value) -> Self {
        Response {
            status: ResponseStatus::Ok,
            kind: Some(kind),
            payload,
        }
    }

    pub fn bad_query(kind: Option<RequestKind>, text: impl Into<String>) -> Self {
        Response {
            status: ResponseStatus::BadQuery,
            kind,
            payload: serde_json::Value::String(text.into()),
        }
    }

    pub fn budget_exceeded(text: impl Into<String>) -> Self {
        Response {
            status: ResponseStatus::BudgetExceeded,
            kind: None,
            payload: serde_json::Value::String(text.into()),
        }
    }

    pub fn accountant_error(text: impl Into<String>) -> Self {
        Response {
            status: ResponseStatus::AccountantError,
            kind: None,
            payload: serde_json::Value::String(text.into()),
        }
    }

    // Deliberately generic: internal failure detail stays in the server log.
    pub fn internal_error() -> Self {
        Response {
            status: ResponseStatus::InternalError,
            kind: None,
            payload: serde_json::Value::String("internal error".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskQuery {
    pub qtype: RiskQueryType,
    pub user: Identity,
    pub eps: Option<f64>,
}

impl RiskQuery {
    pub fn check(user: impl Into<Identity>, eps: f64) -> Self {
        RiskQuery {
            qtype: RiskQueryType::Check,
            user: user.into(),
            eps: Some(eps),
        }
    }

    pub fn info(user: impl Into<Identity>) -> Self {
        RiskQuery {
            qtype: RiskQueryType::Info,
            user: user.into(),
            eps: None,
        }
    }
}

/// Flat risk accountant response tuple. `field1` carries the admission flag
/// (Check), the cumulative spend (Info), or an error text.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskResponse {
    pub status: RiskResponseStatus,
    pub field1: serde_json::Value,
    pub total_threshold: Option<f64>,
    pub per_query_threshold: Option<f64>,
}

impl RiskResponse {
    pub fn admission(granted: bool) -> Self {
        RiskResponse {
            status: RiskResponseStatus::Ok,
            field1: serde_json::Value::from(granted as i64),
            total_threshold: None,
            per_query_threshold: None,
        }
    }

    pub fn usage(used: f64, total_threshold: f64, per_query_threshold: f64) -> Self {
        RiskResponse {
            status: RiskResponseStatus::Ok,
            field1: serde_json::Value::from(used),
            total_threshold: Some(total_threshold),
            per_query_threshold: Some(per_query_threshold),
        }
    }

    pub fn error(status: RiskResponseStatus, text: impl Into<String>) -> Self {
        RiskResponse {
            status,
            field1: serde_json::Value::String(text.into()),
            total_threshold: None,
            per_query_threshold: None,
        }
    }

    pub fn granted(&self) -> Option<bool> {
        if self.status != RiskResponseStatus::Ok {
            return None;
        }
        self.field1.as_i64().map(|v| v != 0)
    }

    pub fn spend(&self) -> Option<(f64, f64, f64)> {
        if self.status != RiskResponseStatus::Ok {
            return None;
        }
        Some((
            self.field1.as_f64()?,
            self.total_threshold?,
            self.per_query_threshold?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for kind in [
            RequestKind::Meta,
            RequestKind::Info,
            RequestKind::Risk,
            RequestKind::Echo,
        ] {
            assert_eq!(RequestKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(RequestKind::from_code(4), None);
    }

    #[test]
    fn risk_response_accessors() {
        let granted = RiskResponse::admission(true);
        assert_eq!(granted.granted(), Some(true));
        assert_eq!(granted.spend(), None);

        let usage = RiskResponse::usage(4.5, 10.0, 3.0);
        assert_eq!(usage.spend(), Some((4.5, 10.0, 3.0)));

        let err = RiskResponse::error(RiskResponseStatus::UserNotFound, "user not found");
        assert_eq!(err.granted(), None);
        assert_eq!(err.spend(), None);
    }

    #[test]
    fn value_untagged_serde_distinguishes_int_and_float() {
        let v: Value = serde_json::from_str("3").unwrap();
        assert_eq!(v, Value::Int(3));
        let v: Value = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, Value::Float(3.5));
        let v: Value = serde_json::from_str("\"setosa\"").unwrap();
        assert_eq!(v, Value::Text("setosa".to_string()));
    }
}

//! Tuple-shaped JSON wire encoding. Every message is a flat JSON array
//! mirroring the protocol tuples in the top-level module; decoding rejects
//! anything that does not parse into a known shape.

use serde_json::Value as Json;

use crate::{
    Comparison, Conjunction, Predicate, QueryPayload, Request, RequestKind, Response,
    ResponseStatus, RiskQuery, RiskQueryType, RiskResponse, RiskResponseStatus, Value,
};

#[derive(Debug)]
pub enum WireError {
    Json(serde_json::Error),
    Shape(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Json(err) => write!(f, "invalid message JSON: {}", err),
            WireError::Shape(what) => write!(f, "invalid message shape: {}", what),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(value: serde_json::Error) -> Self {
        WireError::Json(value)
    }
}

pub fn encode_request(request: &Request) -> Vec<u8> {
    let payload = match &request.payload {
        Some(p) => payload_to_json(p),
        None => Json::Null,
    };
    let tuple = Json::Array(vec![
        Json::from(request.kind.code()),
        request
            .alias
            .as_ref()
            .map(|a| Json::String(a.clone()))
            .unwrap_or(Json::Null),
        Json::from(request.eps),
        payload,
    ]);
    serde_json::to_vec(&tuple).unwrap_or_default()
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, WireError> {
    let tuple: Json = serde_json::from_slice(bytes)?;
    let items = as_tuple(&tuple, 4, "request")?;

    let kind = RequestKind::from_code(as_code(&items[0], "request kind")?)
        .ok_or(WireError::Shape("unknown request kind"))?;
    let alias = opt_string(&items[1], "request alias")?;
    let eps = as_number(&items[2], "request eps")?;
    let payload = match &items[3] {
        Json::Null => None,
        other => Some(payload_from_json(other)?),
    };

    Ok(Request {
        kind,
        alias,
        eps,
        payload,
    })
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    let tuple = Json::Array(vec![
        Json::from(response.status.code()),
        response
            .kind
            .map(|k| Json::from(k.code()))
            .unwrap_or(Json::Null),
        response.payload.clone(),
    ]);
    serde_json::to_vec(&tuple).unwrap_or_default()
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, WireError> {
    let tuple: Json = serde_json::from_slice(bytes)?;
    let items = as_tuple(&tuple, 3, "response")?;

    let status = ResponseStatus::from_code(as_code(&items[0], "response status")?)
        .ok_or(WireError::Shape("unknown response status"))?;
    let kind = match &items[1] {
        Json::Null => None,
        other => Some(
            RequestKind::from_code(as_code(other, "response kind")?)
                .ok_or(WireError::Shape("unknown response kind"))?,
        ),
    };

    Ok(Response {
        status,
        kind,
        payload: items[2].clone(),
    })
}

pub fn encode_risk_query(query: &RiskQuery) -> Vec<u8> {
    let tuple = Json::Array(vec![
        Json::from(query.qtype.code()),
        Json::String(query.user.clone()),
        query.eps.map(Json::from).unwrap_or(Json::Null),
    ]);
    serde_json::to_vec(&tuple).unwrap_or_default()
}

pub fn decode_risk_query(bytes: &[u8]) -> Result<RiskQuery, WireError> {
    let tuple: Json = serde_json::from_slice(bytes)?;
    let items = as_tuple(&tuple, 3, "risk query")?;

    let qtype = RiskQueryType::from_code(as_code(&items[0], "risk query type")?)
        .ok_or(WireError::Shape("unknown risk query type"))?;
    let user = as_string(&items[1], "risk query user")?;
    let eps = match &items[2] {
        Json::Null => None,
        other => Some(as_number(other, "risk query eps")?),
    };

    Ok(RiskQuery { qtype, user, eps })
}

pub fn encode_risk_response(response: &RiskResponse) -> Vec<u8> {
    let tuple = Json::Array(vec![
        Json::from(response.status.code()),
        response.field1.clone(),
        response.total_threshold.map(Json::from).unwrap_or(Json::Null),
        response
            .per_query_threshold
            .map(Json::from)
            .unwrap_or(Json::Null),
    ]);
    serde_json::to_vec(&tuple).unwrap_or_default()
}

pub fn decode_risk_response(bytes: &[u8]) -> Result<RiskResponse, WireError> {
    let tuple: Json = serde_json::from_slice(bytes)?;
    let items = as_tuple(&tuple, 4, "risk response")?;

    let status = RiskResponseStatus::from_code(as_code(&items[0], "risk response status")?)
        .ok_or(WireError::Shape("unknown risk response status"))?;
    let total_threshold = match &items[2] {
        Json::Null => None,
        other => Some(as_number(other, "risk response total threshold")?),
    };
    let per_query_threshold = match &items[3] {
        Json::Null => None,
        other => Some(as_number(other, "risk response per-query threshold")?),
    };

    Ok(RiskResponse {
        status,
        field1: items[1].clone(),
        total_threshold,
        per_query_threshold,
    })
}

fn payload_to_json(payload: &QueryPayload) -> Json {
    let predicate = Json::Array(
        payload
            .predicate
            .iter()
            .map(|conj| {
                Json::Array(vec![
                    Json::from(conj.negated as u8),
                    Json::Array(
                        conj.terms
                            .iter()
                            .map(|t| {
                                Json::Array(vec![
                                    Json::String(t.attribute.clone()),
                                    Json::String(t.operator.clone()),
                                    value_to_json(&t.value),
                                ])
                            })
                            .collect(),
                    ),
                ])
            })
            .collect(),
    );
    let columns = Json::Array(
        payload
            .columns
            .iter()
            .map(|c| Json::String(c.clone()))
            .collect(),
    );
    let parameters = Json::Array(
        payload
            .parameters
            .iter()
            .map(|(name, value)| {
                Json::Array(vec![Json::String(name.clone()), value_to_json(value)])
            })
            .collect(),
    );

    Json::Array(vec![
        Json::Array(vec![
            Json::String(payload.dataset.clone()),
            predicate,
            columns,
        ]),
        Json::Array(vec![Json::String(payload.processor.clone()), parameters]),
    ])
}

fn payload_from_json(json: &Json) -> Result<QueryPayload, WireError> {
    let outer = as_tuple(json, 2, "query payload")?;
    let data_desc = as_tuple(&outer[0], 3, "query data descriptor")?;
    let proc_desc = as_tuple(&outer[1], 2, "query processor descriptor")?;

    let dataset = as_string(&data_desc[0], "dataset name")?;
    let predicate = predicate_from_json(&data_desc[1])?;
    let columns = data_desc[2]
        .as_array()
        .ok_or(WireError::Shape("columns must be an array"))?
        .iter()
        .map(|c| as_string(c, "column name"))
        .collect::<Result<Vec<_>, _>>()?;

    let processor = as_string(&proc_desc[0], "processor name")?;
    let parameters = proc_desc[1]
        .as_array()
        .ok_or(WireError::Shape("parameters must be an array"))?
        .iter()
        .map(|pair| {
            let pair = as_tuple(pair, 2, "parameter pair")?;
            Ok((
                as_string(&pair[0], "parameter name")?,
                value_from_json(&pair[1])?,
            ))
        })
        .collect::<Result<Vec<_>, WireError>>()?;

    Ok(QueryPayload {
        dataset,
        predicate,
        columns,
        processor,
        parameters,
    })
}

fn predicate_from_json(json: &Json) -> Result<Predicate, WireError> {
    json.as_array()
        .ok_or(WireError::Shape("predicate must be an array"))?
        .iter()
        .map(|conj| {
            let conj = as_tuple(conj, 2, "conjunction")?;
            let negated = match conj[0].as_u64() {
                Some(0) => false,
                Some(1) => true,
                _ => return Err(WireError::Shape("negation flag must be 0 or 1")),
            };
            let terms = conj[1]
                .as_array()
                .ok_or(WireError::Shape("conjunction terms must be an array"))?
                .iter()
                .map(|term| {
                    let term = as_tuple(term, 3, "comparison")?;
                    Ok(Comparison {
                        attribute: as_string(&term[0], "comparison attribute")?,
                        operator: as_string(&term[1], "comparison operator")?,
                        value: value_from_json(&term[2])?,
                    })
                })
                .collect::<Result<Vec<_>, WireError>>()?;
            Ok(Conjunction { negated, terms })
        })
        .collect()
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => Json::from(*f),
        Value::Text(s) => Json::String(s.clone()),
    }
}

fn value_from_json(json: &Json) -> Result<Value, WireError> {
    match json {
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                n.as_f64()
                    .map(Value::Float)
                    .ok_or(WireError::Shape("unrepresentable number"))
            }
        }
        Json::String(s) => Ok(Value::Text(s.clone())),
        _ => Err(WireError::Shape("value must be a number or a string")),
    }
}

fn as_tuple<'a>(json: &'a Json, len: usize, what: &'static str) -> Result<&'a Vec<Json>, WireError> {
    let items = json.as_array().ok_or(WireError::Shape(what))?;
    if items.len() != len {
        return Err(WireError::Shape(what));
    }
    Ok(items)
}

fn as_code(json: &Json, what: &'static str) -> Result<u8, WireError> {
    json.as_u64()
        .and_then(|v| u8::try_from(v).ok())
        .ok_or(WireError::Shape(what))
}

fn as_number(json: &Json, what: &'static str) -> Result<f64, WireError> {
    json.as_f64().ok_or(WireError::Shape(what))
}

fn as_string(json: &Json, what: &'static str) -> Result<String, WireError> {
    json.as_str()
        .map(|s| s.to_string())
        .ok_or(WireError::Shape(what))
}

fn opt_string(json: &Json, what: &'static str) -> Result<Option<String>, WireError> {
    match json {
        Json::Null => Ok(None),
        other => Ok(Some(as_string(other, what)?)),
    }
}

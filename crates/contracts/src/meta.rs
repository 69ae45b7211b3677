//! Dataset metadata consumed by the broker and the statistic processors:
//! attribute types, bounds, categorical value sets, per-dataset processor
//! allow-lists, and the comparison operator table.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AttributeType {
    Categorical,
    Integer,
    Float,
    Text,
    Date,
}

impl AttributeType {
    pub fn code(self) -> u8 {
        match self {
            AttributeType::Categorical => 0,
            AttributeType::Integer => 1,
            AttributeType::Float => 2,
            AttributeType::Text => 3,
            AttributeType::Date => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AttributeType::Categorical),
            1 => Some(AttributeType::Integer),
            2 => Some(AttributeType::Float),
            3 => Some(AttributeType::Text),
            4 => Some(AttributeType::Date),
            _ => None,
        }
    }

    /// Histograms only bin categorical and numeric columns.
    pub fn binnable(self) -> bool {
        matches!(
            self,
            AttributeType::Categorical | AttributeType::Integer | AttributeType::Float
        )
    }
}

impl From<AttributeType> for u8 {
    fn from(value: AttributeType) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for AttributeType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        AttributeType::from_code(value).ok_or_else(|| format!("unknown attribute type {}", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryValue {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub atype: AttributeType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    /// Declared value set for categorical attributes, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<CategoryValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub name: String,
    pub size: u64,
    pub description: String,
    pub attributes: Vec<AttributeMeta>,
    /// Processor names permitted against this dataset.
    pub processors: Vec<String>,
}

impl DatasetMeta {
    pub fn attribute(&self, name: &str) -> Option<&AttributeMeta> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperatorSpec {
    pub symbol: &'static str,
    /// Server-side SQL rendering of the operator. Client input is mapped
    /// through this table and never spliced into SQL.
    pub sql: &'static str,
    pub description: &'static str,
}

const EQUALITY_OPERATORS: &[OperatorSpec] = &[
    OperatorSpec {
        symbol: "==",
        sql: "=",
        description: "equal to",
    },
    OperatorSpec {
        symbol: "!=",
        sql: "<>",
        description: "not equal to",
    },
];

const ORDERED_OPERATORS: &[OperatorSpec] = &[
    OperatorSpec {
        symbol: "==",
        sql: "=",
        description: "equal to",
    },
    OperatorSpec {
        symbol: "!=",
        sql: "<>",
        description: "not equal to",
    },
    OperatorSpec {
        symbol: "<",
        sql: "<",
        description: "smaller than",
    },
    OperatorSpec {
        symbol: ">",
        sql: ">",
        description: "greater than",
    },
    OperatorSpec {
        symbol: "<=",
        sql: "<=",
        description: "smaller than or equal to",
    },
    OperatorSpec {
        symbol: ">=",
        sql: ">=",
        description: "greater than or equal to",
    },
];

pub fn operators_for(atype: AttributeType) -> &'static [OperatorSpec] {
    match atype {
        AttributeType::Categorical => EQUALITY_OPERATORS,
        _ => ORDERED_OPERATORS,
    }
}

pub fn operator_spec(atype: AttributeType, symbol: &str) -> Option<&'static OperatorSpec> {
    operators_for(atype).iter().find(|op| op.symbol == symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorical_attributes_only_support_equality() {
        assert!(operator_spec(AttributeType::Categorical, "==").is_some());
        assert!(operator_spec(AttributeType::Categorical, "<").is_none());
        assert!(operator_spec(AttributeType::Float, "<=").is_some());
    }

    #[test]
    fn attribute_type_serializes_as_numeric_code() {
        let json = serde_json::to_string(&AttributeType::Float).unwrap();
        assert_eq!(json, "2");
        let back: AttributeType = serde_json::from_str("0").unwrap();
        assert_eq!(back, AttributeType::Categorical);
        assert!(serde_json::from_str::<AttributeType>("9").is_err());
    }
}

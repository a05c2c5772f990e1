//! The eight data facets a hexad can participate in.
//!
//! Modalities are the unit of capability negotiation between the registry,
//! the resolver and the backend adapters: a store declares a modality set at
//! registration, the adapter family clips it to what the instance can
//! actually serve, and the resolver filters peers by the query's required
//! set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One facet of a hexad. The wire form is the lowercase name and parsing is
/// case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Graph,
    Vector,
    Tensor,
    Semantic,
    Document,
    Temporal,
    Provenance,
    Spatial,
}

impl Modality {
    /// Lowercase string used on the wire and in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Graph => "graph",
            Modality::Vector => "vector",
            Modality::Tensor => "tensor",
            Modality::Semantic => "semantic",
            Modality::Document => "document",
            Modality::Temporal => "temporal",
            Modality::Provenance => "provenance",
            Modality::Spatial => "spatial",
        }
    }

    /// All modalities in a consistent order.
    pub fn all() -> Vec<Modality> {
        vec![
            Modality::Graph,
            Modality::Vector,
            Modality::Tensor,
            Modality::Semantic,
            Modality::Document,
            Modality::Temporal,
            Modality::Provenance,
            Modality::Spatial,
        ]
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "graph" => Ok(Modality::Graph),
            "vector" => Ok(Modality::Vector),
            "tensor" => Ok(Modality::Tensor),
            "semantic" => Ok(Modality::Semantic),
            "document" => Ok(Modality::Document),
            "temporal" => Ok(Modality::Temporal),
            "provenance" => Ok(Modality::Provenance),
            "spatial" => Ok(Modality::Spatial),
            _ => Err(format!(
                "Invalid modality: '{}'. Use one of 'graph', 'vector', 'tensor', 'semantic', \
                 'document', 'temporal', 'provenance', 'spatial'.",
                s
            )),
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("graph".parse::<Modality>().unwrap(), Modality::Graph);
        assert_eq!("VECTOR".parse::<Modality>().unwrap(), Modality::Vector);
        assert_eq!("  Spatial ".parse::<Modality>().unwrap(), Modality::Spatial);
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = "holographic".parse::<Modality>().unwrap_err();
        assert!(err.contains("holographic"));
    }

    #[test]
    fn wire_form_is_lowercase() {
        let j = serde_json::to_string(&Modality::Provenance).unwrap();
        assert_eq!(j, "\"provenance\"");
        assert_eq!(
            serde_json::from_str::<Modality>("\"temporal\"").unwrap(),
            Modality::Temporal
        );
    }

    #[test]
    fn all_lists_eight() {
        assert_eq!(Modality::all().len(), 8);
    }
}

//! Human- and machine-readable snapshots of a frozen topology.
//!
//! Grounded on `JStringification.cc`/`JTablePrinter.cc`, which render the
//! live topology and per-arrow metrics as fixed-width tables for console
//! output. This module re-expresses that as a `serde`-serializable summary
//! type first (so it can be compared, diffed, or emitted as JSON) and
//! offers a table renderer on top of it, rather than building a bespoke
//! text formatter as the only representation.

use serde::{Deserialize, Serialize};

use crate::topology::Topology;

/// One row of a [`TopologySummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrowSummary {
    /// The arrow's stable name.
    pub name: String,
    /// Whether this arrow is a source (no upstream input).
    pub is_source: bool,
    /// Whether this arrow is a sink (runs user processors).
    pub is_sink: bool,
}

/// A serializable snapshot of a frozen [`Topology`]'s structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySummary {
    /// Every arrow, in registration order.
    pub arrows: Vec<ArrowSummary>,
    /// Names of source arrows.
    pub sources: Vec<String>,
    /// Names of sink arrows.
    pub sinks: Vec<String>,
}

impl TopologySummary {
    /// Snapshot `topology`'s current structure.
    #[must_use]
    pub fn from_topology(topology: &Topology) -> Self {
        let arrows = topology
            .arrows()
            .iter()
            .map(|a| ArrowSummary {
                name: a.name().to_string(),
                is_source: a.is_source(),
                is_sink: a.is_sink(),
            })
            .collect();
        Self {
            arrows,
            sources: topology.sources().to_vec(),
            sinks: topology.sinks().to_vec(),
        }
    }

    /// Render as pretty-printed JSON.
    ///
    /// # Errors
    /// Propagates any `serde_json` serialization failure (unexpected for
    /// this type, which contains no non-finite floats or custom
    /// serializers, but the fallible signature is kept for consistency
    /// with the rest of this crate's JSON boundaries).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Render as a fixed-width table, one row per arrow, matching the
    /// column layout `JTablePrinter` uses for its topology dump.
    #[must_use]
    pub fn to_table(&self) -> String {
        let name_width = self
            .arrows
            .iter()
            .map(|a| a.name.len())
            .max()
            .unwrap_or(4)
            .max("NAME".len());

        let mut out = String::new();
        out.push_str(&format!("{:<name_width$}  SOURCE  SINK\n", "NAME", name_width = name_width));
        for arrow in &self.arrows {
            out.push_str(&format!(
                "{:<name_width$}  {:<6}  {:<4}\n",
                arrow.name,
                arrow.is_source,
                arrow.is_sink,
                name_width = name_width
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow::{EmitStatus, Processor, SinkArrow, SourceArrow};
    use crate::topology::{PortBinding, PortDirection, PortKind, TopologyBuilder};
    use jana2_core::{Event, EventLevel};
    use jana2_pool::{Limit, Mailbox, Pool};
    use std::sync::Arc;

    struct NullProcessor;
    impl Processor for NullProcessor {
        fn name(&self) -> &str {
            "null"
        }
        fn process(&self, _event: &Event) -> jana2_core::JanaResult<()> {
            Ok(())
        }
    }

    #[test]
    fn summary_reflects_registered_source_and_sink() {
        let pool = Arc::new(Pool::new(1, 2, Limit::Strict, || Event::new(EventLevel::PhysicsEvent), |_: &mut Event| {}));
        let queue: Arc<Mailbox<Arc<Event>>> = Arc::new(Mailbox::new(1, 4));
        let source = Arc::new(SourceArrow::new(
            "src",
            EventLevel::PhysicsEvent,
            pool.clone(),
            queue.clone(),
            4,
            0,
            None,
            |_e: &Event| Ok(EmitStatus::Success),
        ));
        let sink = Arc::new(SinkArrow::terminal("sink", queue.clone(), vec![Arc::new(NullProcessor)], pool.clone()));

        let mut builder = TopologyBuilder::new();
        builder
            .register(source, vec![PortBinding::new("out", PortDirection::Output, PortKind::Queue, "q")])
            .unwrap();
        builder
            .register(sink, vec![PortBinding::new("in", PortDirection::Input, PortKind::Queue, "q")])
            .unwrap();
        builder.tag_recycle_edge("sink", "src");
        let topology = builder.freeze().unwrap();

        let summary = TopologySummary::from_topology(&topology);
        assert_eq!(summary.arrows.len(), 2);
        assert!(summary.arrows.iter().any(|a| a.name == "src" && a.is_source));
        assert!(summary.arrows.iter().any(|a| a.name == "sink" && a.is_sink));
        assert!(summary.to_table().contains("src"));
        assert!(summary.to_json().unwrap().contains("\"is_source\": true"));
    }
}

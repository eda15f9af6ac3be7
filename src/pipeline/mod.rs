pub mod llm;
pub mod chunks; // Parsed-chunk cache
pub mod grounding; // Page crops for chunk bounding boxes
pub mod sections; // Disjoint section partitioning
pub mod extraction; // Two-stage kernel, scheduler, merge
pub mod evaluation; // Weighted quality scoring
pub mod processor; // Document processing orchestrator

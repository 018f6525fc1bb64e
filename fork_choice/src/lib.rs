pub mod builder;

pub use builder::{
    CanonicalChainBuilder, ChainBuilderError, Connection, FinalityBoundary, PruneOutcome,
};

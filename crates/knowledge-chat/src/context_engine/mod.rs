//! Context engine module - builds what the model sees for one request

pub mod context_assembler;
pub mod retrieval_engine;
pub mod summary_generator;

pub use context_assembler::{
    AssembleRequest, AssembledContext, AssemblerLimits, ContextAssembler, HistoryCutoff,
};
pub use retrieval_engine::{
    RetrievalEngine, RetrievalOutcome, RetrievalQuery, RetrievedDocument,
};
pub use summary_generator::SummaryGenerator;

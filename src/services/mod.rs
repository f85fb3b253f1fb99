//! External service clients: analytical query execution and optional
//! language-model inference. Both sit behind traits so the pipeline can be
//! driven by scripted implementations in tests.

pub mod inference;
pub mod query;

pub use inference::{create_inference, HttpInference, InferenceService, NullInference};
pub use query::{
    HttpQueryService, MetaCube, MetaMember, MetaResponse, QueryFilter, QueryRequest, QueryResult,
    QueryService, TimeDimension,
};

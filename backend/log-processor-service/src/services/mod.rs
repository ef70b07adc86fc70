pub mod classifier;
pub mod persistence;
pub mod stream_consumer;
pub mod supervisor;

pub use classifier::{Classifier, LengthClassifier, LengthModel, ModelSource, ReferenceDistribution};
pub use persistence::{PgLogStore, RecordStore, WriteOutcome};
pub use stream_consumer::{EventStream, GroupStatus, RedisEventStream, StreamBinding};
pub use supervisor::{
    BatchReport, EventOutcome, ProcessingSupervisor, ReclaimPolicy, SupervisorConfig,
    SupervisorState,
};

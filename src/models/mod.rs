pub mod answer;
pub mod batch;
pub mod event;
pub mod loaders;
pub mod prompt;
pub mod question;
pub mod run;
pub mod status;

pub type BatchId = i64;
pub type RunId = i64;
pub type QuestionId = i64;
pub type ModelId = i64;
pub type DatasetId = i64;

pub use answer::{Answer, AnswerInsert, WorkCell};
pub use batch::{Batch, BatchPatch};
pub use event::{Event, EventKind, Topic};
pub use loaders::{load_all_dataset_files, load_dataset_file, DatasetFile};
pub use prompt::{PromptTemplate, TypePrompt};
pub use question::{ApiType, LlmModel, Question, QuestionType};
pub use run::{Run, RunPatch};
pub use status::{BatchStatus, RunStatus};

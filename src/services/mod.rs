pub mod batch_state_manager;
pub mod coordinator;
pub mod interrupts;
pub mod notifier;
pub mod prompt;

pub use batch_state_manager::{BatchStateManager, ResumeCallback};
pub use coordinator::BatchCoordinator;
pub use interrupts::InterruptRegistry;
pub use notifier::Notifier;
pub use prompt::{BatchPromptRegistry, PromptAssembler, TemplatePromptAssembler};

pub mod challenge;
pub mod clock;
pub mod comment;
pub mod errors;
pub mod events;
pub mod identifiers;
pub mod invitation;
pub mod lifecycle;
pub mod membership;
pub mod progress;
pub mod recurrence;
pub mod subtask;
pub mod task;

pub use challenge::*;
pub use clock::*;
pub use comment::*;
pub use errors::*;
pub use events::*;
pub use identifiers::*;
pub use invitation::*;
pub use lifecycle::*;
pub use membership::*;
pub use progress::*;
pub use recurrence::*;
pub use subtask::*;
pub use task::*;

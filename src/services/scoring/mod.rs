pub mod collaborative;
pub mod content;
pub mod popularity;

use std::collections::HashMap;
use uuid::Uuid;

pub use collaborative::CollaborativeScorer;
pub use content::ContentScorer;
pub use popularity::PopularityScorer;

/// Per-candidate scores on [0, 1] from one source. A missing key means the
/// source had no evidence for that item.
pub type ScoreMap = HashMap<Uuid, f32>;

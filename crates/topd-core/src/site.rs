use serde::{Deserialize, Serialize};

pub type SiteId = u32;

/// A tracked property and its running counters for the current period.
///
/// Mirrors one row of the `top_sites` table. In memory the counters are owned
/// by the server's site table; values of this type are point-in-time copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    /// Which counter image the site renders with.
    pub counter_image_id: u32,
    pub hits: u64,
    pub unique_hosts: u64,
    /// Whether the rendered counter shows the numbers or a blank badge.
    pub show_digits: bool,
}

impl Site {
    pub fn new(id: SiteId, counter_image_id: u32, show_digits: bool) -> Self {
        Self {
            id,
            counter_image_id,
            hits: 0,
            unique_hosts: 0,
            show_digits,
        }
    }

    /// Sites nobody visited this period carry nothing worth persisting.
    pub fn is_touched(&self) -> bool {
        self.unique_hosts > 0
    }
}

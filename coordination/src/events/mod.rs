//! Change notifications for the conversation store
//!
//! Components subscribe to the store's bus for the changes they care about
//! (a renderer for new messages, the routing layer for completed rounds)
//! instead of polling state.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │    Store     │────▶│  Event Bus   │────▶│  Subscribers │
//! │  (mutation)  │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, DEFAULT_CHANNEL_CAPACITY};
pub use types::StoreEvent;

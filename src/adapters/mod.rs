//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter      | Implements   | Connects to                      |
//! |--------------|--------------|----------------------------------|
//! | `gpio`       | ActuatorPort | active-low relay bank (HAL pins) |
//! | `json_store` | StorePort    | JSON files in the data directory |
//! | `log_sink`   | EventSink    | `log` facade                     |

pub mod gpio;
pub mod json_store;
pub mod log_sink;

//! orthos-client: HTTP and WebSocket client library
//!
//! Talks to the orthos daemon: machine queries, task submission and
//! cancellation, configuration validation, and the live fleet event stream.
//!
//! # Examples
//!
//! ```no_run
//! use orthos_api::requests::ActionRequest;
//! use orthos_client::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new("http://localhost:8080")?;
//!
//! let free = client.list_machines().architecture("x86_64").free().send().await?;
//! println!("{} free x86_64 machines", free.pagination.total_items);
//!
//! let queued = client
//!     .enqueue_task("lab-042", ActionRequest::PowerCycle, "alice")
//!     .await?;
//! let task = client.get_task(queued.task_id).await?;
//! println!("{} is {}", task.id, task.state);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod http;
pub mod ws;

pub use error::{ClientError, Result};
pub use http::{HttpClient, ListMachinesBuilder};
pub use ws::WsClient;

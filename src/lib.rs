//! # busline
//!
//! `busline` is message-bus middleware built with Rust. Applications send
//! messages point-to-point or publish them to topics; the bus stores them
//! durably, delivers them over HTTP to remote instances with bounded retry,
//! and keeps this instance subscribed to the topics of remote publishers.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `message`: The immutable message envelope, its headers and the sender principal.
//! - `persistence`: Durable storage of queued messages (sled and in-memory).
//! - `queue`: Named queues that turn the stored backlog into concurrent, retried deliveries.
//! - `journal`: Append-only record of sent, received and published messages.
//! - `diagnostics`: Named events emitted by every component.
//! - `transport`: HTTP delivery, topic fan-out and subscription requests.
//! - `subscription`: Subscriber tracking and long-running subscription leases.
//! - `handler`: Dispatch of received messages to application handlers.
//! - `bus`: Wires everything into a running bus instance.
//! - `config`: Handles loading and managing configuration.
//! - `utils`: Contains shared utilities, such as error handling and logging.

pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod handler;
pub mod journal;
pub mod message;
pub mod persistence;
pub mod queue;
pub mod subscription;
pub mod transport;
pub mod utils;

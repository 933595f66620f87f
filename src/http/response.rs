//! Response builder
//!
//! A response is a fixed status line plus the byte length of the resource
//! that follows it. Nothing describing length or content type is sent.

use super::{Status, HTTP_NOT_FOUND, HTTP_OK};
use bytes::Bytes;
use std::fs::File;
use std::io;

/// Status line and payload size for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: Status,
    payload_size: u64,
}

impl Response {
    /// Response for a resource of `payload_size` bytes
    pub fn ok(payload_size: u64) -> Self {
        Response {
            status: Status::OK,
            payload_size,
        }
    }

    /// Response for a missing resource; it carries no body
    pub fn not_found() -> Self {
        Response {
            status: Status::NOT_FOUND,
            payload_size: 0,
        }
    }

    /// Build the response for an open file, or 404 when there is none
    ///
    /// The payload size comes from the file's metadata.
    pub fn for_file(file: Option<&File>) -> io::Result<Self> {
        match file {
            Some(file) => Ok(Self::ok(file.metadata()?.len())),
            None => Ok(Self::not_found()),
        }
    }

    /// Get the status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Number of body bytes to transfer after the head
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Whether a body follows the head
    pub fn has_body(&self) -> bool {
        self.status.is_success()
    }

    /// The bytes written before the body
    pub fn head(&self) -> Bytes {
        if self.status == Status::OK {
            Bytes::from_static(HTTP_OK)
        } else {
            Bytes::from_static(HTTP_NOT_FOUND)
        }
    }
}

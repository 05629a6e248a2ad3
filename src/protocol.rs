//! DHT wire messages.
//!
//! Every RPC travels as a [`Message`]: a correlation id, a [`MessageType`],
//! the sender and receiver descriptors, an `is_response` flag and at most one
//! [`Body`]. A request is built with [`Message::compose`] and one of the
//! request builders; the peer answers by calling one of the response
//! builders on the request it received, which swaps sender and receiver and
//! keeps the correlation id so the reply can be matched to the request.
//!
//! Messages are JSON encoded on the wire; see [`Message::encode`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::node::Node;
use crate::store::Record;

/// RPC kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Noop,
    Ping,
    Store,
    FindNode,
    FindValue,
}

/// A key/value pair carried by STORE requests and FIND_VALUE answers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    /// Content hash of `data`; empty when the sender does not vouch for it.
    #[serde(default)]
    pub hash: Vec<u8>,
}

/// The single typed payload of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    /// STORE request.
    Store(Payload),
    /// FIND_NODE / FIND_VALUE request.
    Find { key: Vec<u8> },
    /// STORE answer.
    Success(bool),
    /// FIND_NODE answer, or FIND_VALUE answer when the value is not held.
    Closest(Vec<Node>),
    /// FIND_VALUE answer when the value is held.
    Value(Payload),
}

/// Reasons a message is rejected by [`Message::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message has no sender")]
    MissingSender,
    #[error("message has no receiver")]
    MissingReceiver,
    #[error("sender descriptor is invalid")]
    InvalidSender,
    #[error("NOOP messages carry no request")]
    Noop,
    #[error("{0:?} request is missing its key")]
    MissingKey(MessageType),
    #[error("STORE request has an empty key or data")]
    EmptyPayload,
    #[error("{0:?} request carries the wrong body")]
    UnexpectedBody(MessageType),
}

/// An RPC envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id shared by a request and its response.
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: Option<Node>,
    pub receiver: Option<Node>,
    #[serde(default)]
    pub is_response: bool,
    #[serde(default)]
    pub body: Option<Body>,
}

impl Message {
    /// Start a new request from `sender` with a fresh correlation id.
    pub fn compose(sender: &Node) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MessageType::Noop,
            sender: Some(sender.clone()),
            receiver: None,
            is_response: false,
            body: None,
        }
    }

    /// Address the message.
    pub fn to(mut self, receiver: &Node) -> Self {
        self.receiver = Some(receiver.clone());
        self
    }

    pub fn ping(mut self) -> Self {
        self.kind = MessageType::Ping;
        self.body = None;
        self
    }

    /// STORE request for a content-addressed record.
    pub fn store(mut self, record: &Record) -> Self {
        self.kind = MessageType::Store;
        self.body = Some(Body::Store(Payload {
            key: record.key.clone(),
            data: record.data.clone(),
            hash: record.hash.clone(),
        }));
        self
    }

    pub fn find_node(mut self, key: &[u8]) -> Self {
        self.kind = MessageType::FindNode;
        self.body = Some(Body::Find { key: key.to_vec() });
        self
    }

    pub fn find_value(mut self, key: &[u8]) -> Self {
        self.kind = MessageType::FindValue;
        self.body = Some(Body::Find { key: key.to_vec() });
        self
    }

    /// Turn a request into its response skeleton.
    fn reply(&self, body: Option<Body>) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            is_response: true,
            body,
        }
    }

    /// PING answer.
    pub fn pong(&self) -> Self {
        self.reply(None)
    }

    /// STORE answer.
    pub fn success(&self, success: bool) -> Self {
        self.reply(Some(Body::Success(success)))
    }

    /// FIND_NODE / FIND_VALUE answer listing known nodes.
    pub fn return_closest(&self, nodes: Vec<Node>) -> Self {
        self.reply(Some(Body::Closest(nodes)))
    }

    /// FIND_VALUE answer carrying the value for the requested key.
    pub fn return_value(&self, data: Vec<u8>) -> Self {
        let key = self.find_key().map(<[u8]>::to_vec).unwrap_or_default();
        self.reply(Some(Body::Value(Payload {
            key,
            data,
            hash: Vec::new(),
        })))
    }

    /// Key of a FIND_NODE / FIND_VALUE request.
    pub fn find_key(&self) -> Option<&[u8]> {
        match &self.body {
            Some(Body::Find { key }) => Some(key),
            _ => None,
        }
    }

    pub fn store_payload(&self) -> Option<&Payload> {
        match &self.body {
            Some(Body::Store(payload)) => Some(payload),
            _ => None,
        }
    }

    pub fn success_flag(&self) -> Option<bool> {
        match &self.body {
            Some(Body::Success(ok)) => Some(*ok),
            _ => None,
        }
    }

    pub fn closest(&self) -> Option<&[Node]> {
        match &self.body {
            Some(Body::Closest(nodes)) => Some(nodes),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Payload> {
        match &self.body {
            Some(Body::Value(payload)) => Some(payload),
            _ => None,
        }
    }

    /// Check that an inbound request is well formed.
    pub fn validate(&self) -> Result<(), MessageError> {
        let sender = self.sender.as_ref().ok_or(MessageError::MissingSender)?;
        if self.receiver.is_none() {
            return Err(MessageError::MissingReceiver);
        }
        if !sender.is_valid() {
            return Err(MessageError::InvalidSender);
        }
        match self.kind {
            MessageType::Noop => Err(MessageError::Noop),
            MessageType::Ping => Ok(()),
            MessageType::FindNode | MessageType::FindValue => match &self.body {
                Some(Body::Find { key }) if !key.is_empty() => Ok(()),
                Some(Body::Find { .. }) | None => Err(MessageError::MissingKey(self.kind)),
                Some(_) => Err(MessageError::UnexpectedBody(self.kind)),
            },
            MessageType::Store => match &self.body {
                Some(Body::Store(payload))
                    if !payload.key.is_empty() && !payload.data.is_empty() =>
                {
                    Ok(())
                }
                Some(Body::Store(_)) | None => Err(MessageError::EmptyPayload),
                Some(_) => Err(MessageError::UnexpectedBody(self.kind)),
            },
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a message received from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

//! Typed requests and replies on top of the generic [`Frame`].
//!
//! The wire format reuses the pairs slot for different things per tag:
//! credentials for AUTH/REGISTER, key/value pairs for writes, bare keys for
//! reads, and `(condKey, condValue), (key, "")` for GET_WHEN. Read replies
//! name every requested key, with the literal `null` standing for "no value".
//! This module is the only place that knows those conventions.

use crate::{
    error::{Error, Result},
    frame::{Frame, Tag},
};

/// Pseudo-key carrying a failure reason.
pub const ERROR_KEY: &str = "ERROR";
/// Pseudo-key of the interim AUTH reply sent while a login is queued.
pub const WAIT_KEY: &str = "WAIT";
/// Key of the write acknowledgement pair.
pub const ACK_KEY: &str = "";
pub const ACK_VALUE: [u8; 1] = [1];
/// Value sent for a requested key that has no value.
pub const NULL_VALUE: &[u8] = b"null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Auth {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
    },
    /// One or more writes.
    Put {
        pairs: Vec<(String, Vec<u8>)>,
    },
    MultiPut {
        pairs: Vec<(String, Vec<u8>)>,
    },
    /// One or more reads.
    Get {
        keys: Vec<String>,
    },
    MultiGet {
        keys: Vec<String>,
    },
    GetWhen {
        key: String,
        cond_key: String,
        cond_value: Vec<u8>,
    },
    Logout {
        username: String,
    },
}

impl Request {
    pub fn tag(&self) -> Tag {
        match self {
            Request::Auth { .. } => Tag::Auth,
            Request::Register { .. } => Tag::Register,
            Request::Put { .. } => Tag::Put,
            Request::MultiPut { .. } => Tag::MultiPut,
            Request::Get { .. } => Tag::Get,
            Request::MultiGet { .. } => Tag::MultiGet,
            Request::GetWhen { .. } => Tag::GetWhen,
            Request::Logout { .. } => Tag::Logout,
        }
    }

    pub fn into_frame(self) -> Frame {
        let tag = self.tag();
        match self {
            Request::Auth { username, password } | Request::Register { username, password } => {
                Frame::new(tag).with_pair(username, password)
            }
            Request::Put { pairs } | Request::MultiPut { pairs } => Frame::from_pairs(tag, pairs),
            Request::Get { keys } | Request::MultiGet { keys } => {
                Frame::from_pairs(tag, keys.into_iter().map(|key| (key, Vec::<u8>::new())))
            }
            // When both keys coincide the frame carries only the condition pair.
            Request::GetWhen {
                key,
                cond_key,
                cond_value,
            } => Frame::new(tag)
                .with_pair(cond_key, cond_value)
                .with_pair(key, Vec::<u8>::new()),
            Request::Logout { username } => Frame::new(tag).with_pair(username, Vec::<u8>::new()),
        }
    }

    /// Interprets a frame read by the server. A frame whose pairs do not fit
    /// its tag yields [`Error::MalformedFrame`]; the stream itself is intact.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let tag = frame.tag();
        let mut pairs = frame.into_pairs();
        let request = match tag {
            Tag::Auth | Tag::Register => {
                let (username, password) = single(tag, pairs)?;
                let password = String::from_utf8(password)
                    .map_err(|_| Error::malformed("password is not utf-8"))?;
                if tag == Tag::Auth {
                    Request::Auth { username, password }
                } else {
                    Request::Register { username, password }
                }
            }
            Tag::Put => Request::Put {
                pairs: at_least_one(tag, pairs)?,
            },
            Tag::MultiPut => Request::MultiPut { pairs },
            Tag::Get => Request::Get {
                keys: keys_of(at_least_one(tag, pairs)?),
            },
            Tag::MultiGet => Request::MultiGet {
                keys: keys_of(pairs),
            },
            Tag::GetWhen => match pairs.len() {
                1 | 2 => {
                    let (cond_key, cond_value) = pairs.remove(0);
                    let key = pairs.pop().map_or_else(|| cond_key.clone(), |(key, _)| key);
                    Request::GetWhen {
                        key,
                        cond_key,
                        cond_value,
                    }
                }
                n => return Err(shape_error(tag, "1 or 2", n)),
            },
            Tag::Logout => match pairs.len() {
                0 => Request::Logout {
                    username: String::new(),
                },
                1 => Request::Logout {
                    username: pairs.remove(0).0,
                },
                n => return Err(shape_error(tag, "0 or 1", n)),
            },
        };
        Ok(request)
    }
}

/// Server answers. The frame tag is always the tag of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// AUTH or REGISTER succeeded for `username`.
    Accepted { username: String, message: String },
    /// AUTH is queued behind the session cap; the final reply follows later.
    Wait(String),
    /// PUT/MULTI_PUT stored (`key` is empty) or LOGOUT done (`key` is the user).
    Ack { key: String },
    /// Every requested key with its value, `None` when it has none.
    Values(Vec<(String, Option<Vec<u8>>)>),
    Error(String),
}

impl Reply {
    pub fn error(reason: impl std::fmt::Display) -> Self {
        Reply::Error(reason.to_string())
    }

    pub fn values<I>(lookups: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<Vec<u8>>)>,
    {
        Reply::Values(lookups.into_iter().collect())
    }

    /// GET_WHEN answer: the target key's value, followed by the condition
    /// pair that released it. Concurrent GET_WHEN replies on one connection
    /// finish in any order; the echoed pairs tell them apart.
    pub fn released(
        key: String,
        value: Option<Vec<u8>>,
        cond_key: String,
        cond_value: Vec<u8>,
    ) -> Self {
        if key == cond_key {
            return Reply::Values(vec![(key, Some(cond_value))]);
        }
        Reply::Values(vec![(key, value), (cond_key, Some(cond_value))])
    }

    pub fn into_frame(self, tag: Tag) -> Frame {
        match self {
            Reply::Accepted { username, message } => Frame::new(tag).with_pair(username, message),
            Reply::Wait(message) => Frame::new(tag).with_pair(WAIT_KEY, message),
            Reply::Ack { key } => Frame::new(tag).with_pair(key, ACK_VALUE),
            Reply::Values(values) => Frame::from_pairs(
                tag,
                values
                    .into_iter()
                    .map(|(key, value)| (key, value.unwrap_or_else(|| NULL_VALUE.to_vec()))),
            ),
            Reply::Error(reason) => Frame::new(tag).with_pair(ERROR_KEY, reason),
        }
    }

    /// Interprets a reply frame by its tag.
    ///
    /// For reads, a lone `ERROR` pair is only an error when the request did
    /// not itself ask for a key named `ERROR`; `asked_for_error_key` carries
    /// that fact.
    pub fn from_frame(frame: Frame, asked_for_error_key: bool) -> Result<Self> {
        let tag = frame.tag();
        let lone_error = frame.len() == 1 && frame.contains_key(ERROR_KEY);
        let mut pairs = frame.into_pairs();

        if lone_error && !(is_read(tag) && asked_for_error_key) {
            let (_, reason) = pairs.remove(0);
            return Ok(Reply::Error(String::from_utf8_lossy(&reason).into_owned()));
        }

        let reply = match tag {
            Tag::Auth | Tag::Register => {
                let (key, value) = single_reply(tag, pairs)?;
                let message = String::from_utf8_lossy(&value).into_owned();
                if tag == Tag::Auth && key == WAIT_KEY {
                    Reply::Wait(message)
                } else {
                    Reply::Accepted {
                        username: key,
                        message,
                    }
                }
            }
            Tag::Put | Tag::MultiPut | Tag::Logout => {
                let (key, _) = single_reply(tag, pairs)?;
                Reply::Ack { key }
            }
            Tag::Get | Tag::MultiGet | Tag::GetWhen => Reply::Values(
                pairs
                    .into_iter()
                    .map(|(key, value)| (key, (value != NULL_VALUE).then_some(value)))
                    .collect(),
            ),
        };
        Ok(reply)
    }
}

fn is_read(tag: Tag) -> bool {
    matches!(tag, Tag::Get | Tag::MultiGet | Tag::GetWhen)
}

fn single(tag: Tag, mut pairs: Vec<(String, Vec<u8>)>) -> Result<(String, Vec<u8>)> {
    if pairs.len() != 1 {
        return Err(shape_error(tag, "1", pairs.len()));
    }
    Ok(pairs.remove(0))
}

fn at_least_one(tag: Tag, pairs: Vec<(String, Vec<u8>)>) -> Result<Vec<(String, Vec<u8>)>> {
    if pairs.is_empty() {
        return Err(shape_error(tag, "at least 1", 0));
    }
    Ok(pairs)
}

fn keys_of(pairs: Vec<(String, Vec<u8>)>) -> Vec<String> {
    pairs.into_iter().map(|(key, _)| key).collect()
}

fn single_reply(tag: Tag, mut pairs: Vec<(String, Vec<u8>)>) -> Result<(String, Vec<u8>)> {
    if pairs.len() != 1 {
        return Err(Error::UnexpectedReply(format!(
            "{tag:?} reply with {} pairs",
            pairs.len()
        )));
    }
    Ok(pairs.remove(0))
}

fn shape_error(tag: Tag, expected: &str, got: usize) -> Error {
    Error::malformed(format!("{tag:?} request needs {expected} pairs, got {got}"))
}

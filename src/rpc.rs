use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;

use log::{trace, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Json,
    pub id: u64,
}

/// Error carried back in a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Bidirectional message transport.
///
/// `receive` returns `Ok(None)` when nothing will arrive any more.
pub trait Channel {
    fn post(&mut self, message: Message) -> Result<()>;
    fn receive(&mut self) -> Result<Option<Message>>;
}

/// Handle for a request whose response has not been collected yet
#[derive(Debug)]
#[must_use]
pub struct PendingCall<R> {
    id: u64,
    method: &'static str,
    _result: PhantomData<R>,
}

/// Client end of the RPC boundary
pub struct RpcClient {
    channel: Box<dyn Channel>,
    next_id: u64,
    /// Responses that arrived while waiting for a different id
    inbox: HashMap<u64, Response>,
}

impl RpcClient {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        RpcClient {
            channel,
            next_id: 1,
            inbox: HashMap::new(),
        }
    }

    /// Send a request without waiting for the answer
    pub fn call<P, R>(&mut self, method: &'static str, params: &P) -> Result<PendingCall<R>>
    where
        P: Serialize,
    {
        let id = self.next_id;
        self.next_id += 1;
        trace!("rpc call {} #{}", method, id);
        self.channel.post(Message::Request(Request {
            method: method.to_string(),
            params: serde_json::to_value(params)?,
            id,
        }))?;
        Ok(PendingCall {
            id,
            method,
            _result: PhantomData,
        })
    }

    /// Collect the response of an earlier `call`
    pub fn wait<R>(&mut self, pending: PendingCall<R>) -> Result<R>
    where
        R: DeserializeOwned,
    {
        loop {
            if let Some(response) = self.inbox.remove(&pending.id) {
                return decode(response);
            }
            match self.channel.receive()? {
                Some(Message::Response(response)) if response.id == pending.id => {
                    return decode(response)
                }
                Some(Message::Response(response)) => {
                    self.inbox.insert(response.id, response);
                }
                Some(other) => warn!("ignoring unexpected message {:?}", other),
                None => {
                    return Err(Error::Rpc(format!(
                        "channel closed while waiting for {} #{}",
                        pending.method, pending.id
                    )))
                }
            }
        }
    }

    pub fn invoke<P, R>(&mut self, method: &'static str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let pending = self.call(method, params)?;
        self.wait(pending)
    }
}

fn decode<R: DeserializeOwned>(response: Response) -> Result<R> {
    if let Some(err) = response.error {
        return Err(Error::from_name(&err.name, err.message));
    }
    Ok(serde_json::from_value(response.result)?)
}

type Handler = Box<dyn FnMut(Json) -> Result<Json>>;

/// Responder end of the RPC boundary
#[derive(Default)]
pub struct RpcServer {
    handlers: HashMap<String, Handler>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request for `method` with `handler`
    pub fn handle<P, R, F>(&mut self, method: &str, mut handler: F)
    where
        P: DeserializeOwned,
        R: Serialize,
        F: FnMut(P) -> Result<R> + 'static,
    {
        self.handlers.insert(
            method.to_string(),
            Box::new(move |params| {
                let params = serde_json::from_value(params)?;
                Ok(serde_json::to_value(handler(params)?)?)
            }),
        );
    }

    pub fn respond(&mut self, request: Request) -> Response {
        let outcome = match self.handlers.get_mut(&request.method) {
            Some(handler) => handler(request.params),
            None => Err(Error::Rpc(format!("no handler for {}", request.method))),
        };
        match outcome {
            Ok(result) => Response {
                result,
                error: None,
                id: request.id,
            },
            Err(err) => Response {
                result: Json::Null,
                error: Some(RemoteError {
                    name: err.name().to_string(),
                    message: err.message().to_string(),
                }),
                id: request.id,
            },
        }
    }

    /// Handle one incoming message, producing the reply if it needs one
    pub fn dispatch(&mut self, message: Message) -> Option<Message> {
        match message {
            Message::Request(request) => Some(Message::Response(self.respond(request))),
            Message::Notification(notification) => {
                if let Some(handler) = self.handlers.get_mut(&notification.method) {
                    if let Err(err) = handler(notification.params) {
                        warn!("notification {} failed: {}", notification.method, err);
                    }
                }
                None
            }
            Message::Response(response) => {
                warn!("server received stray response #{}", response.id);
                None
            }
        }
    }
}

/// In-process channel to an `RpcServer`.
///
/// Messages cross as JSON text. Posted requests are only served when the
/// client next receives, so remote work happens after the caller has moved on.
pub struct LoopbackChannel {
    server: RpcServer,
    inbound: VecDeque<String>,
    outbound: VecDeque<String>,
}

impl LoopbackChannel {
    pub fn new(server: RpcServer) -> Self {
        LoopbackChannel {
            server,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }
}

impl Channel for LoopbackChannel {
    fn post(&mut self, message: Message) -> Result<()> {
        self.inbound.push_back(serde_json::to_string(&message)?);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Message>> {
        while self.outbound.is_empty() {
            let Some(text) = self.inbound.pop_front() else {
                return Ok(None);
            };
            let message: Message = serde_json::from_str(&text)?;
            if let Some(reply) = self.server.dispatch(message) {
                self.outbound.push_back(serde_json::to_string(&reply)?);
            }
        }
        match self.outbound.pop_front() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_client() -> RpcClient {
        let mut server = RpcServer::new();
        server.handle("double", |n: u32| Ok(n * 2));
        server.handle("fail", |_: ()| -> Result<()> { Err(Error::constraint()) });
        RpcClient::new(Box::new(LoopbackChannel::new(server)))
    }

    #[test]
    fn responses_are_matched_by_id() {
        let mut client = echo_client();
        let first = client.call::<_, u32>("double", &1u32).unwrap();
        let second = client.call::<_, u32>("double", &5u32).unwrap();
        // wait out of order; the first response is stashed
        assert_eq!(client.wait(second).unwrap(), 10);
        assert_eq!(client.wait(first).unwrap(), 2);
    }

    #[test]
    fn remote_errors_keep_their_name() {
        let mut client = echo_client();
        let err = client.invoke::<_, ()>("fail", &()).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));

        let missing = client.invoke::<_, ()>("nothing", &()).unwrap_err();
        assert!(matches!(missing, Error::Rpc(_)));
    }

    #[test]
    fn message_shapes_are_distinguished() {
        let request: Message =
            serde_json::from_str(r#"{"method":"m","params":[1],"id":3}"#).unwrap();
        assert!(matches!(request, Message::Request(_)));
        let response: Message = serde_json::from_str(r#"{"result":true,"id":3}"#).unwrap();
        assert!(matches!(response, Message::Response(_)));
        let note: Message = serde_json::from_str(r#"{"method":"m","params":null}"#).unwrap();
        assert!(matches!(note, Message::Notification(_)));
    }
}

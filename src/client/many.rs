//! Typed fan-out responses and the OneMany call handle
//!
//! A OneMany operation runs one logical RPC against N targets and reports
//! per-target results as [`ManyResponse`] values. Unary calls hand back a
//! lazy receiver; streaming calls hand back a [`OneManyCall`] whose `recv`
//! yields one batch per underlying multiplexed read. In both shapes the
//! sequence must be drained until it signals the end, or proxy-side streams
//! are left dangling until the connection drops.

use prost::{Message, Name};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::{Status, Streaming};

use crate::client::conn::ProxiedCall;

/// One target's result for one tick of a OneMany operation.
#[derive(Debug)]
pub struct ManyResponse<O> {
    /// Address of the target that produced this entry.
    pub target: String,
    /// Index into the targets the connection was built with. Distinguishes
    /// duplicated targets.
    pub index: usize,
    /// The decoded response, or the error the target produced. A decode
    /// failure lands here too and does not terminate the sequence.
    pub result: Result<O, Status>,
}

impl<O> ManyResponse<O> {
    pub(crate) fn ok(target: String, index: usize, value: O) -> Self {
        Self {
            target,
            index,
            result: Ok(value),
        }
    }

    pub(crate) fn err(target: String, index: usize, status: Status) -> Self {
        Self {
            target,
            index,
            result: Err(status),
        }
    }
}

/// Pack a typed message into the opaque payload envelope.
pub(crate) fn encode_any<M: Message + Name>(message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: format!("type.googleapis.com/{}", M::full_name()),
        value: message.encode_to_vec(),
    }
}

/// Unpack a payload envelope against the method's output schema.
pub(crate) fn decode_any<O: Message + Name + Default>(
    any: &prost_types::Any,
) -> Result<O, Status> {
    let want = O::full_name();
    let got = any.type_url.rsplit('/').next().unwrap_or_default();
    if got != want {
        return Err(Status::internal(format!(
            "can't decode response: payload is '{}', expected '{}'",
            got, want
        )));
    }
    O::decode(any.value.as_slice())
        .map_err(|e| Status::internal(format!("can't decode response: {}", e)))
}

/// Handle for a streaming OneMany call.
pub struct OneManyCall<I, O> {
    inner: CallInner<I, O>,
}

enum CallInner<I, O> {
    Direct {
        target: String,
        kind: DirectKind<I, O>,
    },
    Proxied(ProxiedCall),
}

enum DirectKind<I, O> {
    /// Server-streaming or bidirectional passthrough: a live response stream,
    /// plus the request sender for the bidirectional case.
    Streamed {
        responses: Streaming<O>,
        requests: Option<mpsc::Sender<I>>,
        done: bool,
    },
    /// Client-streaming passthrough: the single response resolves only after
    /// the request stream is closed.
    ClientUnary {
        requests: Option<mpsc::Sender<I>>,
        response: JoinHandle<Result<O, Status>>,
        done: bool,
    },
}

impl<I, O> OneManyCall<I, O>
where
    I: Message + Name + 'static,
    O: Message + Name + Default + 'static,
{
    pub(crate) fn direct_streamed(
        target: String,
        responses: Streaming<O>,
        requests: Option<mpsc::Sender<I>>,
    ) -> Self {
        Self {
            inner: CallInner::Direct {
                target,
                kind: DirectKind::Streamed {
                    responses,
                    requests,
                    done: false,
                },
            },
        }
    }

    pub(crate) fn direct_client_unary(
        target: String,
        requests: mpsc::Sender<I>,
        response: JoinHandle<Result<O, Status>>,
    ) -> Self {
        Self {
            inner: CallInner::Direct {
                target,
                kind: DirectKind::ClientUnary {
                    requests: Some(requests),
                    response,
                    done: false,
                },
            },
        }
    }

    pub(crate) fn proxied(call: ProxiedCall) -> Self {
        Self {
            inner: CallInner::Proxied(call),
        }
    }

    /// Send one message to every target that is still open.
    pub async fn send(&mut self, message: I) -> Result<(), Status> {
        match &mut self.inner {
            CallInner::Direct {
                kind:
                    DirectKind::Streamed {
                        requests: Some(tx), ..
                    },
                ..
            }
            | CallInner::Direct {
                kind:
                    DirectKind::ClientUnary {
                        requests: Some(tx), ..
                    },
                ..
            } => tx
                .send(message)
                .await
                .map_err(|_| Status::unavailable("request stream closed")),
            CallInner::Direct { .. } => Err(Status::failed_precondition(
                "send on a closed or non-client-streaming call",
            )),
            CallInner::Proxied(call) => call.send_payload(encode_any(&message)).await,
        }
    }

    /// Receive the next batch of per-target responses; one batch corresponds
    /// to one underlying read. `Ok(None)` signals the end of the sequence.
    pub async fn recv(&mut self) -> Result<Option<Vec<ManyResponse<O>>>, Status> {
        match &mut self.inner {
            CallInner::Direct {
                target,
                kind:
                    DirectKind::Streamed {
                        responses, done, ..
                    },
            } => {
                if *done {
                    return Ok(None);
                }
                match responses.message().await {
                    Ok(Some(message)) => {
                        Ok(Some(vec![ManyResponse::ok(target.clone(), 0, message)]))
                    }
                    Ok(None) => {
                        *done = true;
                        Ok(None)
                    }
                    Err(status) => {
                        // The terminal error is itself a response; the next
                        // call reports end of sequence.
                        *done = true;
                        Ok(Some(vec![ManyResponse::err(target.clone(), 0, status)]))
                    }
                }
            }
            CallInner::Direct {
                kind: DirectKind::ClientUnary { .. },
                ..
            } => Err(Status::failed_precondition(
                "use close_and_recv on a client-streaming call",
            )),
            CallInner::Proxied(call) => call.next_batch::<O>().await,
        }
    }

    /// Half-close: no further messages will be sent.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        match &mut self.inner {
            CallInner::Direct {
                kind: DirectKind::Streamed { requests, .. },
                ..
            } => {
                requests.take();
                Ok(())
            }
            CallInner::Direct {
                kind: DirectKind::ClientUnary { requests, .. },
                ..
            } => {
                requests.take();
                Ok(())
            }
            CallInner::Proxied(call) => call.close_send().await,
        }
    }

    /// Half-close, then drain until every target has reported its terminal
    /// status, returning the full collected sequence.
    pub async fn close_and_recv(&mut self) -> Result<Vec<ManyResponse<O>>, Status> {
        self.close_send().await?;

        if let CallInner::Direct {
            target,
            kind: DirectKind::ClientUnary { response, done, .. },
        } = &mut self.inner
        {
            if *done {
                return Ok(Vec::new());
            }
            *done = true;
            let result = match response.await {
                Ok(result) => result,
                Err(e) => Err(Status::internal(format!("call task failed: {}", e))),
            };
            return Ok(vec![ManyResponse {
                target: target.clone(),
                index: 0,
                result,
            }]);
        }

        let mut all = Vec::new();
        while let Some(mut batch) = self.recv().await? {
            all.append(&mut batch);
        }
        Ok(all)
    }
}

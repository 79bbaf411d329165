// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

//! `ServerSocket`: a blocking TCP socket exposed to profiling scripts.

use crate::profiler::builtins::with_session;
use crate::profiler::common::{v8_interned, v8_string, ProfilerError, ScriptError};
use deno_core::v8;
use deno_core::v8::HandleScope;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

/// How often a non-blocking accept is retried while waiting for a connection.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// The largest buffer a single `recv` allocates, whatever length the script asks for.
const MAX_RECV_LEN: usize = 64 * 1024;
/// The private key under which a script object stores its socket id.
const SOCKET_ID_KEY: &str = "ServerSocket#id";

#[derive(Debug)]
enum SocketState {
    Unbound,
    Bound(TcpListener),
    Listening(TcpListener),
    Connected(TcpStream),
}

/// The sockets opened by one profiling session. Dropping the table closes all of them.
///
/// Closing a socket removes it from the table. Ids are issued in increasing order, so an issued id
/// without an entry belongs to a closed socket.
#[derive(Debug, Default)]
pub(crate) struct SocketTable {
    next_id: u32,
    sockets: HashMap<u32, SocketState>,
}

impl SocketTable {
    pub fn create(&mut self) -> u32 {
        self.insert(SocketState::Unbound)
    }

    pub fn bind(&mut self, id: u32, address: &str, port: u16) -> Result<(), ScriptError> {
        let socket = self.get_mut(id)?;
        if !matches!(socket, SocketState::Unbound) {
            return Err(ScriptError::Socket("Bind failed."));
        }
        let listener = TcpListener::bind((address, port)).map_err(|err| {
            tracing::debug!(address, port, %err, "socket bind failed");
            ScriptError::Socket("Bind failed.")
        })?;
        *socket = SocketState::Bound(listener);
        Ok(())
    }

    /// Marks a bound socket as listening. The OS listen queue was already created by `bind`.
    pub fn listen(&mut self, id: u32) -> Result<(), ScriptError> {
        let socket = self.get_mut(id)?;
        match std::mem::replace(socket, SocketState::Unbound) {
            SocketState::Bound(listener) => {
                *socket = SocketState::Listening(listener);
                Ok(())
            }
            other => {
                *socket = other;
                Err(ScriptError::Socket("Listen failed."))
            }
        }
    }

    /// Waits for a connection, returning the id of the connected socket, or `None` if `timeout`
    /// elapses first. Without a timeout, this blocks until a connection arrives.
    pub fn accept(&mut self, id: u32, timeout: Option<Duration>) -> Result<Option<u32>, ScriptError> {
        let SocketState::Listening(listener) = self.get_mut(id)? else {
            return Err(ScriptError::Socket("Accept failed."));
        };
        let accept_failed = |err: std::io::Error| {
            tracing::debug!(%err, "socket accept failed");
            ScriptError::Socket("Accept failed.")
        };

        let stream = match timeout {
            None => {
                listener.set_nonblocking(false).map_err(accept_failed)?;
                listener.accept().map_err(accept_failed)?.0
            }
            Some(timeout) => {
                listener.set_nonblocking(true).map_err(accept_failed)?;
                let deadline = Instant::now() + timeout;
                loop {
                    match listener.accept() {
                        Ok((stream, _)) => break stream,
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Ok(None);
                            }
                            std::thread::sleep(ACCEPT_POLL_INTERVAL.min(deadline - now));
                        }
                        Err(err) => return Err(accept_failed(err)),
                    }
                }
            }
        };
        stream.set_nonblocking(false).map_err(accept_failed)?;
        Ok(Some(self.insert(SocketState::Connected(stream))))
    }

    pub fn send(&mut self, id: u32, data: &[u8]) -> Result<usize, ScriptError> {
        let SocketState::Connected(stream) = self.get_mut(id)? else {
            return Err(ScriptError::Socket("Send failed."));
        };
        stream.write_all(data).map_err(|err| {
            tracing::debug!(%err, "socket send failed");
            ScriptError::Socket("Send failed.")
        })?;
        Ok(data.len())
    }

    /// Reads at most `max_len` bytes (and never more than [`MAX_RECV_LEN`]), returning `None` at
    /// end of stream.
    pub fn recv(&mut self, id: u32, max_len: usize) -> Result<Option<Vec<u8>>, ScriptError> {
        let SocketState::Connected(stream) = self.get_mut(id)? else {
            return Err(ScriptError::Socket("Receive failed."));
        };
        if max_len == 0 {
            return Ok(Some(Vec::new()));
        }
        let mut buf = vec![0; max_len.min(MAX_RECV_LEN)];
        let read = stream.read(&mut buf).map_err(|err| {
            tracing::debug!(%err, "socket receive failed");
            ScriptError::Socket("Receive failed.")
        })?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(buf))
    }

    /// Closes the socket. Closing a closed socket does nothing.
    pub fn close(&mut self, id: u32) -> Result<(), ScriptError> {
        if self.sockets.remove(&id).is_none() && !self.was_issued(id) {
            return Err(ScriptError::NotASocket);
        }
        Ok(())
    }

    fn was_issued(&self, id: u32) -> bool {
        (1..=self.next_id).contains(&id)
    }

    fn insert(&mut self, state: SocketState) -> u32 {
        self.next_id += 1;
        self.sockets.insert(self.next_id, state);
        self.next_id
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut SocketState, ScriptError> {
        let issued = self.was_issued(id);
        match self.sockets.get_mut(&id) {
            Some(socket) => Ok(socket),
            None if issued => Err(ScriptError::Socket("Socket is closed.")),
            None => Err(ScriptError::NotASocket),
        }
    }
}

/// Installs the `ServerSocket` constructor on `global`.
pub(crate) fn install(
    scope: &mut HandleScope,
    global: v8::Local<v8::Object>,
) -> Result<(), ProfilerError> {
    let template = v8::FunctionTemplate::new(scope, construct);
    let class_name = v8_interned(scope, "ServerSocket");
    template.set_class_name(class_name);

    let proto = template.prototype_template(scope);
    macro_rules! method {
        ($name:literal, $callback:expr) => {
            let key = v8_interned(scope, $name);
            let method = v8::FunctionTemplate::new(scope, $callback);
            proto.set(key.into(), method.into());
        };
    }
    method!("bind", bind);
    method!("listen", listen);
    method!("accept", accept);
    method!("send", send);
    method!("recv", recv);
    method!("close", close);

    let constructor = template
        .get_function(scope)
        .ok_or(ProfilerError::OutOfMemory)?;
    global
        .set(scope, class_name.into(), constructor.into())
        .ok_or(ProfilerError::OutOfMemory)?;
    Ok(())
}

fn socket_key<'s>(scope: &mut HandleScope<'s>) -> v8::Local<'s, v8::Private> {
    let name = v8_interned(scope, SOCKET_ID_KEY);
    v8::Private::for_api(scope, Some(name))
}

/// Reads the socket id stored on a script object.
fn socket_id(scope: &mut HandleScope, this: v8::Local<v8::Object>) -> Result<u32, ScriptError> {
    let key = socket_key(scope);
    this.get_private(scope, key)
        .filter(|value| value.is_uint32())
        .and_then(|value| value.uint32_value(scope))
        .ok_or(ScriptError::NotASocket)
}

fn attach_id(
    scope: &mut HandleScope,
    object: v8::Local<v8::Object>,
    id: u32,
) -> Result<(), ScriptError> {
    let key = socket_key(scope);
    let value = v8::Integer::new_from_unsigned(scope, id);
    object
        .set_private(scope, key, value.into())
        .ok_or(ScriptError::OutOfMemory)?;
    Ok(())
}

fn construct<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let this = args.this();
    let is_construct_call = !args.new_target().is_undefined();
    with_session(scope, rv, |scope, session| {
        if !is_construct_call {
            return Err(ScriptError::InvalidArgument(
                "ServerSocket must be called with new.",
            ));
        }
        let id = session.sockets.create();
        attach_id(scope, this, id)?;
        Ok(this.into())
    });
}

fn bind<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let this = args.this();
    let address = args.get(0).to_rust_string_lossy(scope);
    let port = args.get(1);
    let port = port
        .is_number()
        .then(|| port.number_value(scope))
        .flatten()
        .filter(|port| port.fract() == 0.0 && (0.0..=u16::MAX as f64).contains(port))
        .map(|port| port as u16);
    with_session(scope, rv, |scope, session| {
        let id = socket_id(scope, this)?;
        let port = port.ok_or(ScriptError::Socket("Bind failed."))?;
        session.sockets.bind(id, &address, port)?;
        Ok(v8::undefined(scope).into())
    });
}

fn listen<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let this = args.this();
    with_session(scope, rv, |scope, session| {
        let id = socket_id(scope, this)?;
        session.sockets.listen(id)?;
        Ok(v8::undefined(scope).into())
    });
}

fn accept<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let this = args.this();
    let timeout = args.get(0);
    let timeout = if timeout.is_null_or_undefined() {
        None
    } else {
        let millis = timeout.number_value(scope).unwrap_or(0.0);
        Some(Duration::from_millis(if millis.is_finite() && millis > 0.0 {
            millis as u64
        } else {
            0
        }))
    };
    with_session(scope, rv, |scope, session| {
        let id = socket_id(scope, this)?;
        let Some(connected) = session.sockets.accept(id, timeout)? else {
            return Ok(v8::null(scope).into());
        };
        let accepted = v8::Object::new(scope);
        if let Some(proto) = this.get_prototype(scope) {
            accepted.set_prototype(scope, proto);
        }
        attach_id(scope, accepted, connected)?;
        Ok(accepted.into())
    });
}

fn send<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let this = args.this();
    let data = args.get(0).to_rust_string_lossy(scope);
    with_session(scope, rv, |scope, session| {
        let id = socket_id(scope, this)?;
        let sent = session.sockets.send(id, data.as_bytes())?;
        Ok(v8::Number::new(scope, sent as f64).into())
    });
}

fn recv<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let this = args.this();
    let max_len = args.get(0).uint32_value(scope).unwrap_or(0) as usize;
    with_session(scope, rv, |scope, session| {
        let id = socket_id(scope, this)?;
        match session.sockets.recv(id, max_len)? {
            None => Ok(v8::null(scope).into()),
            Some(bytes) => Ok(v8_string(scope, &String::from_utf8_lossy(&bytes)).into()),
        }
    });
}

fn close<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let this = args.this();
    with_session(scope, rv, |scope, session| {
        let id = socket_id(scope, this)?;
        session.sockets.close(id)?;
        Ok(v8::undefined(scope).into())
    });
}

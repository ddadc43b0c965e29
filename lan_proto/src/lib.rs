#![forbid(unsafe_code)]
//! A LAN-oriented RPC networking engine.
//!
//! A [`LanServer`](crate::prelude::LanServer) accepts TCP connections, authenticates clients,
//! assigns each a [`HostId`](lan_types::proto::HostId) and bootstraps a per-connection session
//! key. Clients exchange freeform messages and RPC calls with the server and with each other.
//! Clients that share a P2P group are told to open direct connections to each other; until
//! they do, their traffic is relayed by the server.
//!
//! Services are declared with [`rpc_service!`], which generates the handler trait, the stub
//! and the proxy of a service.
#![deny(unused_extern_crates, unused_import_braces)]

#[macro_use]
pub mod macros {
    /// Declares an RPC service.
    ///
    /// ```ignore
    /// rpc_service! {
    ///     pub service Chat {
    ///         base: 100;
    ///         handler: ChatHandler;
    ///         stub: ChatStub;
    ///         proxy: ChatProxy;
    ///         1 => fn say(text: String);
    ///     }
    /// }
    /// ```
    ///
    /// generates `trait ChatHandler` (every method defaults to
    /// [`RpcError::NotImplemented`](crate::proto::rpc::RpcError::NotImplemented)),
    /// `ChatStub<H: ChatHandler>` implementing [`RpcStub`](crate::proto::rpc::RpcStub), and
    /// `ChatProxy::say(&String) -> Message`. Rpc ids are `base + n`.
    #[macro_export]
    macro_rules! rpc_service {
        (
            $(#[$meta:meta])*
            $vis:vis service $service:ident {
                base: $base:expr;
                handler: $handler:ident;
                stub: $stub:ident;
                proxy: $proxy:ident;
                $(
                    $(#[$fn_meta:meta])*
                    $id:literal => fn $method:ident($($arg:ident: $ty:ty),* $(,)?);
                )*
            }
        ) => {
            $(#[$meta])*
            $vis trait $handler: Send + Sync + 'static {
                $(
                    $(#[$fn_meta])*
                    #[allow(unused_variables, clippy::too_many_arguments)]
                    fn $method(
                        &self,
                        ctx: &$crate::proto::rpc::RpcContext,
                        $($arg: $ty),*
                    ) -> $crate::proto::rpc::RpcResult {
                        Err($crate::proto::rpc::RpcError::NotImplemented)
                    }
                )*
            }

            /// Encodes outbound calls
            $vis struct $proxy;

            #[allow(dead_code, clippy::too_many_arguments, clippy::ptr_arg)]
            impl $proxy {
                $(
                    pub fn $method($($arg: &$ty),*) -> $crate::proto::message::Message {
                        let mut message = $crate::proto::message::Message::new(
                            $crate::proto::message::MessageType::Rpc,
                        );
                        message.write(&$crate::proto::rpc::RpcHeader::call($base + $id));
                        $( message.write($arg); )*
                        message
                    }
                )*
            }

            /// Decodes inbound calls into a handler
            $vis struct $stub<H> {
                handler: H,
            }

            #[allow(dead_code)]
            impl<H: $handler> $stub<H> {
                pub fn new(handler: H) -> Self {
                    Self { handler }
                }

                pub fn handler(&self) -> &H {
                    &self.handler
                }
            }

            impl<H: $handler> $crate::proto::rpc::RpcStub for $stub<H> {
                fn service_name(&self) -> &'static str {
                    stringify!($service)
                }

                fn rpc_ids(&self) -> Vec<$crate::proto::rpc::RpcId> {
                    vec![$($base + $id),*]
                }

                #[allow(unused_mut, unused_variables)]
                fn dispatch(
                    &self,
                    ctx: &$crate::proto::rpc::RpcContext,
                    reader: &mut $crate::proto::message::MessageReader,
                ) -> Result<$crate::proto::rpc::StubOutcome, $crate::error::NetworkError> {
                    let start = reader.position();
                    let header: $crate::proto::rpc::RpcHeader = reader.read()?;

                    $(
                        if header.rpc_id == $base + $id {
                            let mut decode = || -> Result<_, $crate::error::NetworkError> {
                                Ok(($(reader.read::<$ty>()?,)*))
                            };
                            let ($($arg,)*) = match decode() {
                                Ok(args) => args,
                                Err(err) => {
                                    reader.set_position(start);
                                    return Err(err);
                                }
                            };

                            let ctx = ctx.with_rpc_id(header.rpc_id);
                            return Ok(match self.handler.$method(&ctx, $($arg),*) {
                                Ok(()) => $crate::proto::rpc::StubOutcome::Handled,
                                Err($crate::proto::rpc::RpcError::NotImplemented) => {
                                    $crate::proto::rpc::StubOutcome::NotImplemented(header)
                                }
                                Err($crate::proto::rpc::RpcError::Failed(reason)) => {
                                    $crate::proto::rpc::StubOutcome::Failed(header, reason)
                                }
                            });
                        }
                    )*

                    reader.set_position(start);
                    Ok($crate::proto::rpc::StubOutcome::NotHandled)
                }
            }
        };
    }
}

pub mod prelude {
    pub use crate::error::NetworkError;
    pub use crate::proto::client::{JoinedGroupInfo, LanClient};
    pub use crate::proto::destination::Destination;
    pub use crate::proto::events::*;
    pub use crate::proto::message::{
        Bincode, Marshal, Message, MessageReader, MessageType, ReceivedMessage,
    };
    pub use crate::proto::misc::Ticket;
    pub use crate::proto::p2p_group::{P2PGroupInfo, PairPhase, PairwiseInfo};
    pub use crate::proto::rpc::{
        RpcContext, RpcError, RpcHeader, RpcId, RpcResult, RpcStatus, RpcStub, StubOutcome,
        StubRegistry,
    };
    pub use crate::proto::security::SendOptions;
    pub use crate::proto::server::LanServer;
    pub use crate::proto::settings::{
        ClientConfig, ClientSettingsBuilder, ServerConfig, ServerSettingsBuilder,
    };
    pub use lan_io::ThreadPoolSource;
    pub use lan_types::prelude::*;
}

/// Contains the constants used by this crate
pub mod constants;
/// The default error type for this crate
pub mod error;
/// The engine itself
pub mod proto;

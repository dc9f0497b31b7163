//! Entry layers. They settle where a client is going before handing it to a [`NextLayer`].

use crate::commands::Command;
use crate::connection::TransportProtocol;
use crate::context::Context;
use crate::events::Event;
use crate::layer::{Commands, Engine, Layer, Logic, NextLayer, Step};
use crate::options::{ConnectionStrategy, ProxyMode};
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Delegate,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The configured reverse proxy target.
    Reverse,
    /// The address the client connected to, already set on the server.
    Transparent,
}

pub struct DestinationKnown {
    context: Context,
    destination: Destination,
    child: Box<dyn Layer>,
    phase: Phase,
}

/// Relays every client to the target in [`ProxyMode::Reverse`].
pub struct ReverseProxy;

impl ReverseProxy {
    pub fn layer(context: Context) -> Engine<DestinationKnown> {
        DestinationKnown::build(context, Destination::Reverse)
    }
}

/// Relays clients to where they were going before being redirected.
pub struct TransparentProxy;

impl TransparentProxy {
    pub fn layer(context: Context) -> Engine<DestinationKnown> {
        DestinationKnown::build(context, Destination::Transparent)
    }
}

impl DestinationKnown {
    fn build(context: Context, destination: Destination) -> Engine<Self> {
        let child = NextLayer::boxed(context.clone());
        Engine::new(
            context.clone(),
            Self {
                context,
                destination,
                child,
                phase: Phase::Start,
            },
        )
    }

    fn point_at_target(&mut self) -> Result<(), String> {
        let mut server = self.context.server.lock();
        match (&self.context.options.mode, self.destination) {
            (ProxyMode::Reverse { scheme, address, via }, Destination::Reverse) => {
                server
                    .set_address(Some(address.clone()))
                    .map_err(|e| e.to_string())?;
                if scheme.is_secure() && !self.context.options.keep_host_header {
                    server.sni = Some(address.host.clone());
                }
                server.set_via(via.clone()).map_err(|e| e.to_string())?;
            }
            (mode, Destination::Transparent) => {
                assert!(server.address().is_some(), "No server address set.");
                server.set_via(mode.via().cloned()).map_err(|e| e.to_string())?;
            }
            (mode, Destination::Reverse) => {
                panic!("reverse proxy layer in {} mode", mode.name())
            }
        }
        Ok(())
    }

    /// Connects upstream right away under the eager strategy, then starts the child.
    fn finish_start(&mut self, out: &mut Commands) -> Step<Self> {
        let eager = {
            let server = self.context.server.lock();
            self.context.options.connection_strategy == ConnectionStrategy::Eager
                && server.address().is_some()
                && server.transport_protocol == TransportProtocol::Tcp
        };
        let step = if eager {
            let server = self.context.server.clone();
            Step::emit(Command::open_connection(&server), out)
        } else {
            Step::Ready(None)
        };
        step.then(self, out, |this: &mut Self, out, err| {
            if err.is_some() {
                this.phase = Phase::Done;
                let client = this.context.client.clone();
                return Step::emit(Command::close_connection(&client), out).map(|_| ());
            }
            this.phase = Phase::Delegate;
            out.extend(this.child.handle_event(Event::Start));
            Step::done()
        })
    }
}

impl Logic for DestinationKnown {
    fn name(&self) -> &'static str {
        match self.destination {
            Destination::Reverse => "ReverseProxy",
            Destination::Transparent => "TransparentProxy",
        }
    }

    fn handle(&mut self, event: Event, out: &mut Commands) -> Step<Self> {
        match self.phase {
            Phase::Start => {
                assert!(
                    matches!(event, Event::Start),
                    "{}: expected Start, got {}",
                    self.name(),
                    event
                );
                if let Err(e) = self.point_at_target() {
                    out.push(Command::log(
                        format!("Cannot relay {}: {}", self.context.client, e),
                        Level::ERROR,
                    ));
                    self.phase = Phase::Done;
                    let client = self.context.client.clone();
                    return Step::emit(Command::close_connection(&client), out).map(|_| ());
                }
                self.finish_start(out)
            }
            Phase::Delegate => {
                out.extend(self.child.handle_event(event));
                Step::done()
            }
            Phase::Done => Step::done(),
        }
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.name(), self.child.describe())
    }

    fn child_mut(&mut self) -> Option<&mut Box<dyn Layer>> {
        Some(&mut self.child)
    }
}

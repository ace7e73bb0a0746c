/*!
A lightweight in-process actor runtime multiplexing many services over a
fixed pool of worker threads.

Each *service* owns a private inbox of messages and a callback; worker
threads pull ready inboxes and run one batch of messages at a time.
Auxiliary threads drive wall-clock timers, socket readiness, liveness
monitoring, simulated-time compression, and (optionally) deterministic
replay of a captured session.

The runtime is a good fit when:

* You have many small, mostly-idle actors rather than a few hot ones.
* Work arrives in bursts and latency matters, but you cannot afford a
  spinning worker per actor.
* You occasionally need to fast-forward simulated time (load tests, game
  servers) or re-run a session exactly as it happened (debugging).

## Usage

Register service types on a [`Config`], name one of them as the bootstrap
service, and call [`start`]; it returns once every service has exited.

```no_run
use colony::{Config, Message, MessageKind, Runtime, Service, ServiceContext};
use std::sync::Arc;

struct Echo;

impl Service for Echo {
    fn message(&mut self, rt: &Arc<Runtime>, ctx: &ServiceContext, msg: Message) {
        match msg.kind {
            MessageKind::Text => {
                rt.send(ctx.handle(), msg.source, MessageKind::Response, msg.session, msg.data);
            }
            MessageKind::System => rt.retire_all(),
            _ => {}
        }
    }
}

fn main() -> Result<(), colony::Error> {
    let mut config = Config::new();
    config.thread = 4;
    config.register("echo", |_rt, _args| Ok(Box::new(Echo)));
    config.bootstrap = Some("echo".to_string());
    colony::start(config)
}
```

## Portability

Linux-only: the socket bridge and signal handling go through `nix`.
*/

mod config;
mod context;
mod daemon;
mod error;
mod handle;
mod harbor;
mod logger;
mod monitor;
mod mq;
mod record;
mod runtime;
mod scheduler;
mod service;
mod socket;
mod timer;

pub use config::Config;
pub use context::ServiceContext;
pub use error::Error;
pub use handle::{Handle, HANDLE_MASK};
pub use mq::{Message, MessageKind};
pub use runtime::Runtime;
pub use scheduler::start;
pub use service::Service;
pub use socket::{SocketEvent, SocketId};

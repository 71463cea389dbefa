/*!
A loopback bridge between a web page and local commands.

loopgate runs a single TCP listener on `127.0.0.1` that speaks two protocols on the same
port:

- a tiny **binary protocol** used by a helper process (launched from a custom URL) to hand
  off one command request, and
- a **WebSocket endpoint** the page polls for the result of that command.

The two meet in a [`jobs::JobRegistry`]: the helper submits a job under a callback id, and
the page asks for that id until the job is no longer pending.

# Overview

```text
 browser click                      browser page
      |                                  |
 custom URL handler                 ws://127.0.0.1:18245/
      |  "SGR" + len + JSON              |  "reqCallback:<id>"
      v                                  v
 +-------------------- Listener --------------------+
 |  handshake::classify -> Connection (Binary | WS) |
 +-------------------------+------------------------+
                           | Bridge
                           v
                      JobRegistry  -- echo / delay / external process
```

No async runtime is involved. The listener, every connection and every job run on their
own threads, and the two pieces of shared state (the connection set and the job table)
each sit behind one mutex.

# Protocols

## Binary

```text
client -> server:  "SGR" | u32 length (little endian) | JSON CommandRequest
server -> client:  1 byte, 1 = handled, 0 = failed; then the connection closes
```

[`loopgate_internal::wire::handoff`] is the client side.

## WebSocket

An RFC 6455 upgrade on `/`, with the `Host` header naming `127.0.0.1` or `localhost` on the
listening port. The page sends `reqCallback:<id>` text messages and receives

```json
{"status":"pending","output":"step 1/3\n"}
{"status":"completed","output":"...","exitcode":0}
```

with `status` one of `pending`, `completed`, `error` or `unknown`.

# Quick Start

```no_run
use loopgate::{Bridge, JobRegistry, Listener, ServerConfig, Supervisor};
use std::sync::Arc;

let config = ServerConfig::from_env();
let registry = Arc::new(JobRegistry::new());
let listener = Listener::new(config.clone(), Arc::new(Bridge::new(registry.clone())));
listener.start(config.port)?;
// returns once the server has been idle for `config.idle_timeout`
Supervisor::new(&config).run(&listener, &registry);
# Ok::<(), loopgate::listener::Error>(())
```

# Logging

All diagnostics go through [logwise](https://sealedabstract.com/code/logwise). No logger is
installed by this crate.
*/

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod jobs;
pub mod listener;
pub mod supervisor;

pub use bridge::Bridge;
pub use config::ServerConfig;
pub use connection::Connection;
pub use jobs::JobRegistry;
pub use listener::Listener;
pub use supervisor::Supervisor;

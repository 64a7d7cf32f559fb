// A TFTP (RFC 1350) server that accepts uploads of captured images.
//
// Only write transfers are carried out. Read requests are recognised and ignored, and netascii
// mode is accepted but handled exactly like octet.
//
// Transfer begins with a WRQ sent to the well-known port. The server answers from a freshly bound
// port, which is its TID for the rest of the transfer; the client's source port is the client's
// TID. Every packet of the transfer must travel between those two TIDs. A packet from anywhere
// else is answered with an "unknown TID" ERROR without disturbing the transfer.
//
// The file is sent in DATA blocks of 512 bytes numbered from 1, wrapping from 65535 to 0. Each
// block is acknowledged before the next one is sent. A block shorter than 512 bytes (possibly
// empty) ends the transfer.
//
// Packets (all 16-bit fields big-endian):
//
// RRQ/WRQ:  0 | 1/2 | Filename | 0 | Mode | 0
// DATA:     0 | 3   | Block # (2 bytes) | Data (0-512 bytes)
// ACK:      0 | 4   | Block # (2 bytes)
// ERROR:    0 | 5   | ErrorCode (2 bytes) | ErrMsg | 0
//
// Error codes:
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 7    No such user
//
// The server never retransmits on its own. When the client's DATA goes missing the server times
// out, waits again a bounded number of times and then gives up silently. A duplicated DATA
// block is acknowledged again but stored only once.

pub mod processor;
pub mod request;
pub mod server;
pub mod sink;
pub mod srv_conn;
pub mod tftp;
pub mod validate;

pub use request::{Operation, Request};
pub use server::{Listener, ServerConfig, ServerContext};
pub use sink::{ImageQueue, ImageSink, ReceivedImage};
pub use srv_conn::{ServerConnectionError, TransferOutcome, TransferSession};

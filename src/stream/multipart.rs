//! `multipart/x-mixed-replace` framing, byte-compatible with existing viewers

use bytes::{BufMut, BytesMut};

use crate::stream::RepairedFrame;

pub const BOUNDARY: &str = "uvc_stream";

/// Sent once per connection, ends with the opening boundary line
pub const RESPONSE_HEADER: &str = "HTTP/1.0 200 OK\r\n\
Server: UVC Streamer\r\n\
Content-Type: multipart/x-mixed-replace;boundary=uvc_stream\r\n\
Cache-Control: no-cache\r\n\
Cache-Control: private\r\n\
Pragma: no-cache\r\n\
\r\n\
--uvc_stream\n";

/// Closes one part and opens the next
pub const PART_TRAILER: &str = "\n--uvc_stream\n";

/// Append one complete part: headers, repaired frame, trailing boundary.
pub fn encode_part(out: &mut BytesMut, epoch_millis: u64, frame: &RepairedFrame<'_>) {
    let head = format!("Content-type: image/jpeg\nX-StartTime: {}\n\n", epoch_millis);
    out.reserve(head.len() + frame.len() + PART_TRAILER.len());
    out.put_slice(head.as_bytes());
    frame.put_into(out);
    out.put_slice(PART_TRAILER.as_bytes());
}

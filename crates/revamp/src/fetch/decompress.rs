use async_compression::tokio::bufread::{DeflateDecoder, GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
	Gzip,
	Deflate,
}

/// Parses a `Content-Encoding` value. `identity` (or absence) means no work;
/// anything we did not ask for (we only advertise gzip and deflate) is
/// treated as unknown and left alone.
pub fn parse_encoding(header: Option<&str>) -> Option<Encoding> {
	match header?.trim().to_ascii_lowercase().as_str() {
		"gzip" | "x-gzip" => Some(Encoding::Gzip),
		"deflate" => Some(Encoding::Deflate),
		_ => None,
	}
}

/// Inflates a fully buffered body. HTTP `deflate` is zlib-wrapped, but some
/// servers send raw deflate streams; both are accepted.
pub async fn decompress(body: &[u8], encoding: Encoding) -> std::io::Result<Bytes> {
	match encoding {
		Encoding::Gzip => {
			let mut decoder = GzipDecoder::new(BufReader::new(body));
			let mut out = Vec::with_capacity(body.len() * 3);
			decoder.read_to_end(&mut out).await?;
			Ok(Bytes::from(out))
		},
		Encoding::Deflate => {
			let mut decoder = ZlibDecoder::new(BufReader::new(body));
			let mut out = Vec::with_capacity(body.len() * 3);
			match decoder.read_to_end(&mut out).await {
				Ok(_) => Ok(Bytes::from(out)),
				Err(_) => {
					let mut decoder = DeflateDecoder::new(BufReader::new(body));
					let mut out = Vec::with_capacity(body.len() * 3);
					decoder.read_to_end(&mut out).await?;
					Ok(Bytes::from(out))
				},
			}
		},
	}
}

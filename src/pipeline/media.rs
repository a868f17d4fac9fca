//! Media normalization for the attempt loop (§4.4 "Media handling").

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::llm::{AIError, ContentPart};
use crate::upstream::MediaUpload;

const VIDEO_MIME_WHITELIST: &[&str] = &["video/mp4", "video/webm", "video/3gpp"];

/// A part resolved to something the upload step can act on directly.
pub enum ResolvedMedia {
	/// Already-decoded bytes from a `data:` URL, normalized mime type.
	Inline { mime_type: String, data_base64: String },
	/// An HTTP(S) URL to try direct upload-by-reference first.
	Remote(String),
}

pub fn resolve(part: &ContentPart) -> Result<ResolvedMedia, AIError> {
	let url = match part {
		ContentPart::ImageUrl { url } | ContentPart::VideoUrl { url } | ContentPart::FileUrl { url, .. } => url,
	};
	if let Some(rest) = url.strip_prefix("data:") {
		return decode_data_url(rest, matches!(part, ContentPart::VideoUrl { .. }));
	}
	Ok(ResolvedMedia::Remote(url.clone()))
}

fn decode_data_url(rest: &str, is_video: bool) -> Result<ResolvedMedia, AIError> {
	let (header, payload) = rest.split_once(',').ok_or(AIError::MalformedDataUrl)?;
	let mime = header.split(';').next().unwrap_or_default();
	let is_base64 = header.contains(";base64");
	if !is_base64 {
		return Err(AIError::MalformedDataUrl);
	}
	// Validate the payload decodes (normalization below re-encodes verbatim
	// since we don't transcode pixel data here; only mime-type is adjusted).
	BASE64.decode(payload)?;

	let normalized_mime = if is_video {
		if VIDEO_MIME_WHITELIST.contains(&mime) {
			mime.to_string()
		} else {
			"video/mp4".to_string()
		}
	} else if mime == "image/png" || mime == "image/jpeg" {
		mime.to_string()
	} else {
		"image/png".to_string()
	};

	Ok(ResolvedMedia::Inline {
		mime_type: normalized_mime,
		data_base64: payload.to_string(),
	})
}

pub fn resolved_to_upload(resolved: &ResolvedMedia) -> MediaUpload {
	match resolved {
		ResolvedMedia::Inline { mime_type, data_base64 } => MediaUpload::Inline {
			mime_type: mime_type.clone(),
			data: data_base64.clone(),
		},
		ResolvedMedia::Remote(url) => MediaUpload::Url(url.clone()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn non_standard_image_mime_normalizes_to_png() {
		let part = ContentPart::ImageUrl {
			url: "data:image/gif;base64,AAAA".to_string(),
		};
		match resolve(&part).unwrap() {
			ResolvedMedia::Inline { mime_type, .. } => assert_eq!(mime_type, "image/png"),
			_ => panic!("expected inline"),
		}
	}

	#[test]
	fn jpeg_passes_through_unchanged() {
		let part = ContentPart::ImageUrl {
			url: "data:image/jpeg;base64,AAAA".to_string(),
		};
		match resolve(&part).unwrap() {
			ResolvedMedia::Inline { mime_type, .. } => assert_eq!(mime_type, "image/jpeg"),
			_ => panic!("expected inline"),
		}
	}

	#[test]
	fn non_whitelisted_video_mime_normalizes_to_mp4() {
		let part = ContentPart::VideoUrl {
			url: "data:video/quicktime;base64,AAAA".to_string(),
		};
		match resolve(&part).unwrap() {
			ResolvedMedia::Inline { mime_type, .. } => assert_eq!(mime_type, "video/mp4"),
			_ => panic!("expected inline"),
		}
	}

	#[test]
	fn http_url_resolves_to_remote() {
		let part = ContentPart::ImageUrl {
			url: "https://example.com/cat.png".to_string(),
		};
		assert!(matches!(resolve(&part).unwrap(), ResolvedMedia::Remote(_)));
	}
}

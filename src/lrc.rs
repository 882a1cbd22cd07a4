//! Text formats of the stage artifacts: ASR transcripts, saved lyrics and LRC.

use crate::types::{Lyrics, SongIdentity, Transcript, TranscriptSegment};

const TRANSCRIPT_HEADER: &str = "Timestamped Transcription:";
const LYRICS_RULE: &str = "============================================================";

/// Render a transcript as `[0.92s -> 4.46s] text` lines under a header
pub fn render_transcript(transcript: &Transcript) -> String {
    let mut out = format!("{TRANSCRIPT_HEADER}\n\n");
    for segment in &transcript.segments {
        out.push_str(&format!(
            "[{:.2}s -> {:.2}s] {}\n",
            segment.start,
            segment.end,
            segment.text.trim()
        ));
    }
    out
}

/// Parse transcript lines, ignoring anything that isn't a timestamped segment
pub fn parse_transcript(content: &str) -> Transcript {
    Transcript::new(content.lines().filter_map(parse_segment_line).collect())
}

fn parse_segment_line(line: &str) -> Option<TranscriptSegment> {
    let rest = line.trim().strip_prefix('[')?;
    let (range, text) = rest.split_once(']')?;
    let (start, end) = range.split_once("->")?;
    let start = start.trim().strip_suffix('s')?.trim().parse::<f64>().ok()?;
    let end = end.trim().strip_suffix('s')?.trim().parse::<f64>().ok()?;
    if !start.is_finite() || !end.is_finite() || end < start {
        return None;
    }
    Some(TranscriptSegment {
        start,
        end,
        text: text.trim().to_string(),
    })
}

/// Format seconds as an LRC `[mm:ss.xx]` tag
pub fn format_timestamp(seconds: f64) -> String {
    let total_hundredths = (seconds.max(0.0) * 100.0).round() as u64;
    let minutes = total_hundredths / 6000;
    let secs = (total_hundredths % 6000) / 100;
    let hundredths = total_hundredths % 100;
    format!("[{minutes:02}:{secs:02}.{hundredths:02}]")
}

/// True if any line carries a `[mm:ss.xx]` or `[mm:ss]` time tag
pub fn has_timestamps(content: &str) -> bool {
    content.lines().any(|line| {
        line.match_indices('[')
            .any(|(idx, _)| is_time_tag(&line[idx + 1..]))
    })
}

fn is_time_tag(after_bracket: &str) -> bool {
    let Some((tag, _)) = after_bracket.split_once(']') else {
        return false;
    };
    let Some((minutes, seconds)) = tag.split_once(':') else {
        return false;
    };
    let digits = |s: &str, min: usize, max: usize| {
        (min..=max).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
    };
    if !digits(minutes, 2, 3) {
        return false;
    }
    match seconds.split_once('.') {
        Some((whole, frac)) => digits(whole, 2, 2) && digits(frac, 2, 3),
        None => digits(seconds, 2, 2),
    }
}

/// Number of lines carrying at least one time tag
pub fn timed_line_count(content: &str) -> usize {
    content
        .lines()
        .filter(|line| has_timestamps(line))
        .count()
}

/// Lyric lines with time tags and `[ti:]`-style header tags removed
pub fn lyric_text(content: &str) -> String {
    let mut lines = Vec::new();
    for line in content.lines() {
        let mut rest = line.trim();
        let mut tagged = false;
        while let Some(after) = rest.strip_prefix('[') {
            let Some((tag, tail)) = after.split_once(']') else {
                break;
            };
            if !is_time_tag(after) && !is_header_tag(tag) {
                break;
            }
            tagged = true;
            rest = tail.trim_start();
        }
        let rest = rest.trim();
        if !rest.is_empty() {
            lines.push(rest);
        } else if !tagged && lines.last().is_some_and(|l| !l.is_empty()) {
            lines.push("");
        }
    }
    lines.join("\n").trim().to_string()
}

fn is_header_tag(tag: &str) -> bool {
    tag.split_once(':').is_some_and(|(key, _)| {
        !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphabetic())
    })
}

/// Prefix LRC content with `[ti:]`/`[ar:]`/`[al:]` tags unless it already has them
pub fn with_metadata_tags(lrc: &str, identity: &SongIdentity, album: Option<&str>) -> String {
    if lrc.trim_start().starts_with("[ti:") {
        return lrc.to_string();
    }
    let mut tags = vec![
        format!("[ti:{}]", identity.title),
        format!("[ar:{}]", identity.artist),
    ];
    if let Some(album) = album.map(str::trim).filter(|a| !a.is_empty()) {
        tags.push(format!("[al:{album}]"));
    }
    format!("{}\n\n{}", tags.join("\n"), lrc.trim_start())
}

/// Render the saved lyrics artifact
pub fn render_lyrics_file(identity: &SongIdentity, lyrics: &Lyrics) -> String {
    format!(
        "Lyrics for '{}' by {}\n{LYRICS_RULE}\n\n{}\n\nSource: {}\n",
        identity.title,
        identity.artist,
        lyrics.text.trim(),
        lyrics.source
    )
}

/// Parse a saved lyrics artifact; `None` if it has no lyrics body
pub fn parse_lyrics_file(content: &str) -> Option<Lyrics> {
    let (_, body) = content.split_once(LYRICS_RULE)?;
    let (text, source) = match body.rsplit_once("\nSource: ") {
        Some((text, source)) => (text, source.trim().to_string()),
        None => (body, String::new()),
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(Lyrics {
        text: text.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lyric_text_strips_tags() {
        let lrc = "[ti:Gurenge]\n[ar:LiSA]\n\n[00:01.00]Tsuyoku nareru riyuu\n\
                   [00:04.50][01:10.00]Shitta\n[00:08.00]\n[00:09.00] [brackets] stay\n";
        assert_eq!(
            lyric_text(lrc),
            "Tsuyoku nareru riyuu\nShitta\n[brackets] stay"
        );
        assert_eq!(lyric_text("plain line"), "plain line");
        assert_eq!(lyric_text("[ti:only]\n[00:01.00]"), "");
    }

    fn identity() -> SongIdentity {
        SongIdentity {
            title: "Gurenge".into(),
            artist: "LiSA".into(),
            language: Some("Japanese".into()),
        }
    }

    #[test]
    fn test_transcript_parse_render() {
        let transcript = Transcript::new(vec![
            TranscriptSegment {
                start: 0.92,
                end: 4.46,
                text: "ああ 素晴らしき世界に今日も乾杯".into(),
            },
            TranscriptSegment {
                start: 5.0,
                end: 7.25,
                text: "second line".into(),
            },
        ]);
        let rendered = render_transcript(&transcript);
        assert!(rendered.starts_with("Timestamped Transcription:\n\n"));
        assert!(rendered.contains("[0.92s -> 4.46s] ああ 素晴らしき世界に今日も乾杯"));
        assert_eq!(parse_transcript(&rendered), transcript);
    }

    #[test]
    fn test_parse_transcript_skips_garbage() {
        let content = "header\n[1.00s -> 0.50s] backwards\n[abc -> 2s] bad\n[2.00s -> 3.00s] ok";
        let parsed = parse_transcript(content);
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].text, "ok");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "[00:00.00]");
        assert_eq!(format_timestamp(4.46), "[00:04.46]");
        assert_eq!(format_timestamp(75.5), "[01:15.50]");
        assert_eq!(format_timestamp(-3.0), "[00:00.00]");
    }

    #[test]
    fn test_has_timestamps() {
        assert!(has_timestamps("[00:12.34]hello"));
        assert!(has_timestamps("[ti:x]\n[01:02]line"));
        assert!(has_timestamps("[100:02.123]long song"));
        assert!(!has_timestamps("[ti:Gurenge]\n[ar:LiSA]"));
        assert!(!has_timestamps("plain lyrics\nno tags"));
        assert!(!has_timestamps(""));
    }

    #[test]
    fn test_metadata_tags_prefix_once() {
        let tagged = with_metadata_tags("[00:01.00]a", &identity(), Some("Gurenge EP"));
        assert_eq!(
            tagged,
            "[ti:Gurenge]\n[ar:LiSA]\n[al:Gurenge EP]\n\n[00:01.00]a"
        );
        assert_eq!(with_metadata_tags(&tagged, &identity(), None), tagged);
    }

    #[test]
    fn test_lyrics_file_parse_render() {
        let lyrics = Lyrics {
            text: "line one\nline two".into(),
            source: "lrclib.net".into(),
        };
        let rendered = render_lyrics_file(&identity(), &lyrics);
        assert!(rendered.starts_with("Lyrics for 'Gurenge' by LiSA\n"));
        assert_eq!(parse_lyrics_file(&rendered), Some(lyrics));
    }

    #[test]
    fn test_lyrics_file_without_body_is_invalid() {
        let content = format!("Lyrics for 'x' by y\n{LYRICS_RULE}\n\n\n\nSource: lrclib.net\n");
        assert_eq!(parse_lyrics_file(&content), None);
        assert_eq!(parse_lyrics_file("truncated header"), None);
    }
}

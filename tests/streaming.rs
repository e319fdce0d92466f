//! End-to-end decode → re-encode checks: wire frames through the binary
//! decoder, the event accumulator and both SSE encoders.

use kirogate::convert::response::{openai_response, ResponseCollector};
use kirogate::stream::anthropic::AnthropicSseEncoder;
use kirogate::upstream::decoder::{encode_frame, FrameDecoder};
use kirogate::upstream::events::{EventAccumulator, StreamEvent};

use serde_json::{json, Value};

/// Decode a byte stream and run every event through the accumulator.
fn pump(wire: &[u8], thinking: bool) -> (Vec<StreamEvent>, EventAccumulator) {
    let mut decoder = FrameDecoder::new();
    let mut accumulator = EventAccumulator::new(thinking);
    let mut events = Vec::new();
    for frame in decoder.feed(wire).expect("stream decodes") {
        events.extend(accumulator.handle(&frame.event_type, &frame.payload));
    }
    events.extend(accumulator.finish());
    (events, accumulator)
}

mod decoder_resync {
    use super::*;

    /// A garbage byte between two valid frames costs one error count but
    /// loses neither event.
    #[test]
    fn garbage_byte_between_frames_is_survivable() {
        let mut wire = encode_frame("assistantResponseEvent", &json!({"content": "one"}));
        wire.push(0xEE);
        wire.extend(encode_frame("assistantResponseEvent", &json!({"content": "two"})));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(decoder.corrupt_events >= 1);
    }

    #[test]
    fn stream_survives_byte_level_fragmentation() {
        let mut wire = Vec::new();
        for i in 0..5 {
            wire.extend(encode_frame(
                "assistantResponseEvent",
                &json!({"content": format!("part{} ", i)}),
            ));
        }

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire {
            frames.extend(decoder.feed(&[byte]).unwrap());
        }
        assert_eq!(frames.len(), 5);
        assert_eq!(decoder.residual(), 0);
    }
}

mod full_pipeline {
    use super::*;

    /// The documented non-stream tool-call scenario: one tool-use frame
    /// plus metadata must yield `finish_reason == "tool_calls"` and a
    /// 15-token usage total.
    #[test]
    fn openai_tool_call_roundtrip() {
        let mut wire = encode_frame(
            "toolUseEvent",
            &json!({"toolUseId": "u1", "name": "t", "input": "{\"x\":1}", "stop": true}),
        );
        wire.extend(encode_frame(
            "messageMetadataEvent",
            &json!({"usage": {"uncachedInputTokens": 10, "outputTokens": 5}}),
        ));

        let (events, accumulator) = pump(&wire, false);
        let mut collector = ResponseCollector::new();
        for event in &events {
            collector.absorb(event);
        }
        let usage = collector.finalize_usage(accumulator.usage());
        let response = openai_response("claude-sonnet-4-5", &collector, &usage);

        assert_eq!(response.choices[0].finish_reason, "tool_calls");
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "u1");
        assert_eq!(calls[0].function.name, "t");
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");
        assert_eq!(response.usage.total_tokens, 15);
    }

    /// The documented streamed-thinking scenario: `<thinking>` content
    /// split awkwardly across three frames becomes one thinking block
    /// followed by one text block.
    #[test]
    fn anthropic_thinking_stream() {
        let mut wire = Vec::new();
        for chunk in ["<think", "ing>secret</think", "ing>\n\nanswer"] {
            wire.extend(encode_frame(
                "assistantResponseEvent",
                &json!({"content": chunk}),
            ));
        }

        let (events, accumulator) = pump(&wire, true);
        let mut encoder = AnthropicSseEncoder::new("claude-sonnet-4-5", 0);
        let mut blocks = encoder.start();
        for event in &events {
            blocks.extend(encoder.on_event(event));
        }
        blocks.extend(encoder.finish(&accumulator.usage()));

        let parsed: Vec<Value> = blocks
            .iter()
            .map(|b| {
                let data = b.lines().find_map(|l| l.strip_prefix("data: ")).unwrap();
                serde_json::from_str(data).unwrap()
            })
            .collect();

        let starts: Vec<&Value> = parsed
            .iter()
            .filter(|e| e["type"] == "content_block_start")
            .collect();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0]["content_block"]["type"], "thinking");
        assert_eq!(starts[1]["content_block"]["type"], "text");

        let thinking: String = parsed
            .iter()
            .filter(|e| e["type"] == "content_block_delta")
            .filter_map(|e| e["delta"]["thinking"].as_str())
            .collect();
        assert_eq!(thinking, "secret");

        let text: String = parsed
            .iter()
            .filter(|e| e["type"] == "content_block_delta")
            .filter_map(|e| e["delta"]["text"].as_str())
            .collect();
        assert_eq!(text, "answer");
    }

    /// Property: any event mix produces a well-formed Anthropic trace:
    /// one message_start, one message_stop (last), balanced blocks,
    /// strictly increasing indices.
    #[test]
    fn anthropic_traces_are_well_formed() {
        let scenarios: Vec<Vec<Value>> = vec![
            vec![json!({"content": "plain"})],
            vec![
                json!({"content": "<thinking>x</thinking>\n\nanswer"}),
                json!({"content": " more"}),
            ],
            vec![json!({"content": ""})],
        ];

        for frames in scenarios {
            let mut wire = Vec::new();
            for payload in &frames {
                wire.extend(encode_frame("assistantResponseEvent", payload));
            }
            wire.extend(encode_frame(
                "toolUseEvent",
                &json!({"toolUseId": "u9", "name": "t", "input": "{}", "stop": true}),
            ));

            let (events, accumulator) = pump(&wire, true);
            let mut encoder = AnthropicSseEncoder::new("m", 0);
            let mut blocks = encoder.start();
            for event in &events {
                blocks.extend(encoder.on_event(event));
            }
            blocks.extend(encoder.finish(&accumulator.usage()));

            let parsed: Vec<Value> = blocks
                .iter()
                .map(|b| {
                    let data = b.lines().find_map(|l| l.strip_prefix("data: ")).unwrap();
                    serde_json::from_str(data).unwrap()
                })
                .collect();

            let count = |t: &str| parsed.iter().filter(|e| e["type"] == t).count();
            assert_eq!(count("message_start"), 1);
            assert_eq!(count("message_stop"), 1);
            assert_eq!(parsed.last().unwrap()["type"], "message_stop");
            assert_eq!(count("content_block_start"), count("content_block_stop"));

            let mut last_index = -1i64;
            let mut open = false;
            for event in &parsed {
                match event["type"].as_str().unwrap() {
                    "content_block_start" => {
                        assert!(!open, "only one block open at a time");
                        open = true;
                        let idx = event["index"].as_i64().unwrap();
                        assert!(idx > last_index, "indices strictly increase");
                        last_index = idx;
                    }
                    "content_block_stop" => {
                        assert!(open);
                        open = false;
                    }
                    _ => {}
                }
            }
            assert!(!open);
        }
    }

    /// Content-length exception mid-stream surfaces as a synthetic stop.
    #[test]
    fn content_length_exception_truncates_cleanly() {
        let mut wire = encode_frame("assistantResponseEvent", &json!({"content": "partial"}));
        wire.extend(encode_frame(
            "exceptionEvent",
            &json!({"__type": "ContentLengthExceededException"}),
        ));

        let (events, _) = pump(&wire, false);
        assert!(events.contains(&StreamEvent::ContentLengthExceeded));
    }
}

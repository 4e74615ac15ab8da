use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use tempfile::TempDir;
use tokio::process::Command;

use dvr_core::{
    AggregateState, CommandExecutor, DailyStore, DvrConfig, MergeSection, NewSegment,
    RecordingPipeline, RecordingSection, SegmentState, SegmentStore, StorageSection, ToolsSection,
};

/// Stands in for ffmpeg/ffprobe. Concat writes the artifact with the concat
/// list contents as its bytes, so tests can assert both ordering and that a
/// restored backup kept the original bytes.
#[derive(Default)]
struct StubMedia {
    fail_concats: Mutex<usize>,
    invalid_validates: Mutex<usize>,
    concat_lists: Mutex<Vec<Vec<String>>>,
}

impl StubMedia {
    fn take(counter: &Mutex<usize>) -> bool {
        let mut remaining = counter.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    fn concat_calls(&self) -> usize {
        self.concat_lists.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for StubMedia {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let std_command = command.as_std();
        let program = std_command.get_program().to_string_lossy().to_string();
        let args: Vec<String> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();

        if program.contains("ffprobe") {
            let entries = args
                .iter()
                .position(|arg| arg == "-show_entries")
                .map(|idx| args[idx + 1].clone())
                .unwrap_or_default();
            if entries == "format=duration,size" {
                if Self::take(&self.invalid_validates) {
                    return Ok(ok_output("0.0\n100\n"));
                }
                return Ok(ok_output("42.5\n2000000\n"));
            }
            return Ok(ok_output("42.5\n"));
        }

        if args.iter().any(|arg| arg == "concat") {
            let list_path = args
                .iter()
                .position(|arg| arg == "-i")
                .map(|idx| args[idx + 1].clone())
                .expect("concat invocation carries a list file");
            let inputs: Vec<String> = std::fs::read_to_string(&list_path)
                .unwrap_or_default()
                .lines()
                .map(|line| {
                    line.trim_start_matches("file '")
                        .trim_end_matches('\'')
                        .to_string()
                })
                .collect();
            self.concat_lists.lock().unwrap().push(inputs.clone());
            if Self::take(&self.fail_concats) {
                return Ok(fail_output("concat exploded"));
            }
            let output_path = args.last().expect("concat invocation names an output");
            std::fs::write(output_path, inputs.join("\n"))?;
            return Ok(ok_output(""));
        }

        if args.iter().any(|arg| arg == "-vframes") {
            let output_path = args.last().expect("thumbnail invocation names an output");
            std::fs::write(output_path, b"jpeg")?;
        }
        Ok(ok_output(""))
    }
}

fn ok_output(stdout: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

fn fail_output(stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(256),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

fn test_config(dir: &Path) -> DvrConfig {
    let data_dir = dir.join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    DvrConfig {
        storage: StorageSection {
            data_dir: data_dir.to_string_lossy().to_string(),
            segments_db: "segments.sqlite".into(),
            daily_db: "daily.sqlite".into(),
        },
        recording: RecordingSection {
            output_dir: dir.join("videos").to_string_lossy().to_string(),
            video_url_base: "http://localhost:8081/videos".into(),
            title_template: "Daily replay {date}".into(),
            retention_days: 3,
        },
        merge: MergeSection {
            max_attempts: 2,
            retry_delay_seconds: 0,
        },
        tools: ToolsSection::default(),
    }
}

fn build_pipeline(dir: &TempDir) -> (RecordingPipeline, Arc<StubMedia>, DvrConfig) {
    let config = test_config(dir.path());
    let stub = Arc::new(StubMedia::default());
    let pipeline = RecordingPipeline::new(&config, Some(stub.clone())).expect("pipeline builds");
    (pipeline, stub, config)
}

fn write_segment_file(dir: &TempDir, date: &str, name: &str) -> String {
    let segment_dir = dir.path().join("recordings").join("live").join(date);
    std::fs::create_dir_all(&segment_dir).unwrap();
    let path = segment_dir.join(name);
    std::fs::write(&path, format!("flv:{name}")).unwrap();
    path.to_string_lossy().to_string()
}

async fn wait_for_merge(pipeline: &RecordingPipeline, date: NaiveDate) {
    for _ in 0..500 {
        if !pipeline.is_merging(date) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("merge for {date} did not finish");
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

#[tokio::test]
async fn merges_all_segments_into_ready_artifact() {
    let dir = TempDir::new().unwrap();
    let (pipeline, stub, config) = build_pipeline(&dir);
    let day = date("2025-06-01");

    let mut raw_paths = Vec::new();
    for name in ["001.flv", "002.flv", "003.flv"] {
        let path = write_segment_file(&dir, "2025-06-01", name);
        let segment = pipeline.ingest("live", "main", &path).unwrap();
        assert_eq!(segment.state, SegmentState::Ready);
        raw_paths.push(path);
    }

    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;

    let daily = DailyStore::new(config.daily_db_path()).unwrap();
    let aggregate = daily.fetch_by_date(day).unwrap().unwrap();
    assert_eq!(aggregate.state, AggregateState::Ready);
    assert_eq!(aggregate.segment_count, 3);
    assert_eq!(aggregate.duration_seconds, Some(43));
    assert!(aggregate.artifact_path.is_some());

    let segments = SegmentStore::new(config.segments_db_path()).unwrap();
    for segment in segments.list_for_date(day).unwrap() {
        assert_eq!(segment.state, SegmentState::Merged);
    }
    for path in &raw_paths {
        assert!(!Path::new(path).exists(), "raw file should be removed");
    }
    assert_eq!(stub.concat_calls(), 1);

    let view = pipeline.get_by_date(day).unwrap().unwrap();
    let url = view.public_url.unwrap();
    assert!(url.contains("?v="), "public url carries cache buster: {url}");
}

#[tokio::test]
async fn failing_tool_exhausts_attempts_and_marks_failed() {
    let dir = TempDir::new().unwrap();
    let (pipeline, stub, config) = build_pipeline(&dir);
    let day = date("2025-06-02");

    let path = write_segment_file(&dir, "2025-06-02", "001.flv");
    pipeline.ingest("live", "main", &path).unwrap();
    *stub.fail_concats.lock().unwrap() = 2;

    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;

    let daily = DailyStore::new(config.daily_db_path()).unwrap();
    let aggregate = daily.fetch_by_date(day).unwrap().unwrap();
    assert_eq!(aggregate.state, AggregateState::Failed);
    assert_eq!(stub.concat_calls(), 2, "exactly max_attempts concat runs");

    let segments = SegmentStore::new(config.segments_db_path()).unwrap();
    let segment = &segments.list_for_date(day).unwrap()[0];
    assert_eq!(segment.state, SegmentState::Ready, "segment stays ready");
    assert!(Path::new(&path).exists(), "raw file survives a failed merge");
}

#[tokio::test]
async fn concurrent_triggers_run_exactly_one_merge() {
    let dir = TempDir::new().unwrap();
    let (pipeline, stub, config) = build_pipeline(&dir);
    let day = date("2025-06-03");

    let path = write_segment_file(&dir, "2025-06-03", "001.flv");
    pipeline.ingest("live", "main", &path).unwrap();

    for _ in 0..8 {
        pipeline.trigger_merge(day);
    }
    wait_for_merge(&pipeline, day).await;

    assert_eq!(stub.concat_calls(), 1, "duplicate triggers are no-ops");
    let daily = DailyStore::new(config.daily_db_path()).unwrap();
    assert_eq!(
        daily.fetch_by_date(day).unwrap().unwrap().state,
        AggregateState::Ready
    );
}

#[tokio::test]
async fn merged_date_is_not_remerged() {
    let dir = TempDir::new().unwrap();
    let (pipeline, stub, _config) = build_pipeline(&dir);
    let day = date("2025-06-04");

    let path = write_segment_file(&dir, "2025-06-04", "001.flv");
    pipeline.ingest("live", "main", &path).unwrap();
    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;
    assert_eq!(stub.concat_calls(), 1);

    let before = pipeline.get_by_date(day).unwrap().unwrap();

    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;

    assert_eq!(stub.concat_calls(), 1, "ready artifact is never re-merged");
    let after = pipeline.get_by_date(day).unwrap().unwrap();
    assert_eq!(before.updated_at, after.updated_at);
}

#[tokio::test]
async fn failed_remerge_restores_previous_artifact() {
    let dir = TempDir::new().unwrap();
    let (pipeline, stub, config) = build_pipeline(&dir);
    let day = date("2025-06-05");

    let path = write_segment_file(&dir, "2025-06-05", "001.flv");
    pipeline.ingest("live", "main", &path).unwrap();
    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;

    let daily = DailyStore::new(config.daily_db_path()).unwrap();
    let aggregate = daily.fetch_by_date(day).unwrap().unwrap();
    let artifact = aggregate.artifact_path.clone().unwrap();
    let original_bytes = std::fs::read(&artifact).unwrap();

    // Simulate an operator re-merge after the date regressed to failed, with
    // a fresh segment and a toolchain that now produces corrupt output.
    daily.update_state(day, AggregateState::Failed).unwrap();
    let extra = write_segment_file(&dir, "2025-06-05", "002.flv");
    pipeline.ingest("live", "main", &extra).unwrap();
    *stub.invalid_validates.lock().unwrap() = 2;

    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;

    let aggregate = daily.fetch_by_date(day).unwrap().unwrap();
    assert_eq!(aggregate.state, AggregateState::Failed);
    let restored_bytes = std::fs::read(&artifact).unwrap();
    assert_eq!(
        original_bytes, restored_bytes,
        "backup restore must preserve the published artifact"
    );
}

#[tokio::test]
async fn segments_concat_in_order_regardless_of_arrival() {
    let dir = TempDir::new().unwrap();
    let (pipeline, stub, config) = build_pipeline(&dir);
    let day = date("2025-06-06");

    let segments = SegmentStore::new(config.segments_db_path()).unwrap();
    let daily = DailyStore::new(config.daily_db_path()).unwrap();
    daily.ensure_for_date(day, "Daily replay 06/06/2025").unwrap();

    // Arrival order 3, 1, 2; assigned orders decide the concat sequence.
    for (order, name) in [(3, "c.flv"), (1, "a.flv"), (2, "b.flv")] {
        let path = write_segment_file(&dir, "2025-06-06", name);
        segments
            .insert(&NewSegment {
                recording_date: day,
                stream_key: "main".into(),
                app_name: "live".into(),
                file_path: path,
                segment_order: order,
                size_bytes: None,
            })
            .unwrap();
    }

    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;

    let lists = stub.concat_lists.lock().unwrap();
    let inputs = &lists[0];
    assert!(inputs[0].ends_with("a.flv"));
    assert!(inputs[1].ends_with("b.flv"));
    assert!(inputs[2].ends_with("c.flv"));
}

#[tokio::test]
async fn merge_without_ready_segments_is_terminal() {
    let dir = TempDir::new().unwrap();
    let (pipeline, stub, config) = build_pipeline(&dir);
    let day = date("2025-06-07");

    let daily = DailyStore::new(config.daily_db_path()).unwrap();
    daily.ensure_for_date(day, "Daily replay 07/06/2025").unwrap();

    pipeline.trigger_merge(day);
    wait_for_merge(&pipeline, day).await;

    assert_eq!(stub.concat_calls(), 0, "no input means no tool invocation");
    assert_eq!(
        daily.fetch_by_date(day).unwrap().unwrap().state,
        AggregateState::Pending
    );
}

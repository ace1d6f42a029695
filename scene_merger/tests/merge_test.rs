//! Runs real ffmpeg. `cargo test -p scene_merger -- --ignored`

use std::path::Path;

use chrono::NaiveDate;
use scene_merger::{Config, merge_scenes};
use sr_app::{AssetKind, ProjectManifest, StageOptions};
use sr_ffmpeg::merge::within_one_frame;
use sr_ffmpeg::probe::{media_duration, probe};
use tokio::process::Command;

async fn lavfi(source: &str, codec: &[&str], path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let status = Command::new("ffmpeg")
        .args(["-hide_banner", "-y", "-f", "lavfi", "-i", source])
        .args(codec)
        .arg(path)
        .status()
        .await
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn narrated_scenes_are_merged_and_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let created_at = NaiveDate::from_ymd_opt(2025, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();
    let manifest = ProjectManifest::create(dir.path(), "coffee", created_at)
        .await
        .unwrap();
    let paths = manifest.paths();
    std::fs::write(
        paths.scenes_file(),
        r#"[
            {"scene_id": 1, "visual_prompt": "a", "audio_text": "One.", "duration": 8},
            {"scene_id": 2, "visual_prompt": "b", "audio_text": "Two.", "duration": 8}
        ]"#,
    )
    .unwrap();
    let scenes = manifest.load_scenes().await.unwrap();

    for (scene_id, audio_secs) in [(1, 8.2), (2, 2.5)] {
        lavfi(
            "testsrc=size=320x240:rate=6:duration=4.1",
            &["-c:v", "libx264", "-pix_fmt", "yuv420p"],
            &paths.asset(AssetKind::Clip, scene_id),
        )
        .await;
        lavfi(
            &format!("sine=frequency=440:duration={audio_secs}"),
            &["-c:a", "libmp3lame"],
            &paths.asset(AssetKind::Audio, scene_id),
        )
        .await;
    }

    let report =
        merge_scenes(&manifest, &scenes, &Config::default(), StageOptions::default()).await;
    assert_eq!(report.generated, 2);

    for scene_id in [1, 2] {
        let audio = media_duration(&paths.asset(AssetKind::Audio, scene_id))
            .await
            .unwrap();
        let merged = probe(&paths.asset(AssetKind::FinalClip, scene_id))
            .await
            .unwrap();
        let duration = merged.duration().unwrap();
        assert!(
            within_one_frame(audio, duration, 6.0),
            "scene {scene_id}: audio {audio}s, merged {duration}s"
        );
        assert!(merged.has_audio());
    }

    let again = merge_scenes(&manifest, &scenes, &Config::default(), StageOptions::default()).await;
    assert_eq!(again.skipped, 2);
}

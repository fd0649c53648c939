//! Linkcast core crate.
//!
//! Pipeline scope:
//! - raw transfer-event ingestion and per-link window aggregation
//! - lag/rolling/calendar feature derivation with chronological splits
//! - sequence tensor construction for window-input model families
//! - champion selection over trained-family metrics and HTTP serving

mod aggregate;
mod champion;
mod config;
mod features;
mod ingest;
mod metrics;
mod observability;
mod predict;
mod serve;
mod split;
mod windows;

pub use aggregate::{
    aggregate_events, nearest_rank_percentile, open_store, read_windows_sorted,
    validate_aggregate_config, write_windows, AggregateConfig, AggregateError, AggregateReport,
    WindowRow,
};
pub use champion::{
    load_descriptor, select_and_persist, select_champion, ChampionDescriptor, SelectionConfig,
    SelectionError, SelectionPolicy,
};
pub use config::{
    load_params, params_path_from_env, validate_params, ConfigError, DataPaths, PipelineConfig,
    DEFAULT_PARAMS_PATH,
};
pub use features::{
    build_features, resolve_column, write_atomic, write_features_csv, FeatureBuildReport,
    FeatureError, FeatureParams, FeatureRow, FeatureSchema, FeatureTable, KpiJoinStatus,
    BASE_NUMERIC_COLUMNS, CALENDAR_COLUMNS, FEATURE_SCHEMA_VERSION, KPI_KEY_CANDIDATES,
    KPI_TIME_CANDIDATES,
};
pub use ingest::{
    load_raw_events, parse_utc_timestamp, IngestError, IngestReport, RawEvent,
    TIMESTAMP_CANDIDATES,
};
pub use metrics::{
    mae, read_metrics_dir, rmse, smape, split_metrics, write_metrics, MetricsError, ModelMetrics,
    SplitMetrics,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_champion_loaded, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use predict::{
    load_champion, parse_model_type, ModelKind, PredictError, PredictorHandle, SequenceCheckpoint,
    SequencePredictor, TabularBundle, TabularPredictor,
};
pub use serve::{predict_router, PredictPayload, ServeState};
pub use split::{
    assign_splits, split_sizes, validate_fractions, Split, SplitError, SplitFractions,
    SplitSummary, FRACTION_SUM_TOLERANCE,
};
pub use windows::{
    build_split_windows, build_windows, read_manifest, validate_sequence_params, write_manifest,
    SequenceParams, SequenceSamples, WindowError, WindowManifest, WindowingReport,
};

//! Integration test modules.

mod magnetic_pipeline_test;
mod mock_engines;
mod shared_sensor_test;

mod docker;

pub use docker::DockerPlatform;

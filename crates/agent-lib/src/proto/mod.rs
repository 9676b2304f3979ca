//! Container Runtime Interface wire types
//!
//! Hand-written prost messages for the subset of `runtime.v1.RuntimeService`
//! the scanner uses. Field tags follow `k8s.io/cri-api/pkg/apis/runtime/v1/api.proto`;
//! fields the exporter never reads are left out and skipped on decode.

pub mod runtime {
    pub mod v1 {
        use prost::Message;
        use std::collections::HashMap;

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum PodSandboxState {
            SandboxReady = 0,
            SandboxNotready = 1,
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum ContainerState {
            ContainerCreated = 0,
            ContainerRunning = 1,
            ContainerExited = 2,
            ContainerUnknown = 3,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodSandboxStateValue {
            #[prost(enumeration = "PodSandboxState", tag = "1")]
            pub state: i32,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodSandboxFilter {
            #[prost(string, tag = "1")]
            pub id: String,
            #[prost(message, optional, tag = "2")]
            pub state: Option<PodSandboxStateValue>,
            #[prost(map = "string, string", tag = "3")]
            pub label_selector: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ListPodSandboxRequest {
            #[prost(message, optional, tag = "1")]
            pub filter: Option<PodSandboxFilter>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodSandboxMetadata {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(string, tag = "2")]
            pub uid: String,
            #[prost(string, tag = "3")]
            pub namespace: String,
            #[prost(uint32, tag = "4")]
            pub attempt: u32,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodSandbox {
            #[prost(string, tag = "1")]
            pub id: String,
            #[prost(message, optional, tag = "2")]
            pub metadata: Option<PodSandboxMetadata>,
            #[prost(enumeration = "PodSandboxState", tag = "3")]
            pub state: i32,
            #[prost(int64, tag = "4")]
            pub created_at: i64,
            #[prost(map = "string, string", tag = "5")]
            pub labels: HashMap<String, String>,
            #[prost(map = "string, string", tag = "6")]
            pub annotations: HashMap<String, String>,
            #[prost(string, tag = "7")]
            pub runtime_handler: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ListPodSandboxResponse {
            #[prost(message, repeated, tag = "1")]
            pub items: Vec<PodSandbox>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStateValue {
            #[prost(enumeration = "ContainerState", tag = "1")]
            pub state: i32,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerFilter {
            #[prost(string, tag = "1")]
            pub id: String,
            #[prost(message, optional, tag = "2")]
            pub state: Option<ContainerStateValue>,
            #[prost(string, tag = "3")]
            pub pod_sandbox_id: String,
            #[prost(map = "string, string", tag = "4")]
            pub label_selector: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ListContainersRequest {
            #[prost(message, optional, tag = "1")]
            pub filter: Option<ContainerFilter>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerMetadata {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(uint32, tag = "2")]
            pub attempt: u32,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct Container {
            #[prost(string, tag = "1")]
            pub id: String,
            #[prost(string, tag = "2")]
            pub pod_sandbox_id: String,
            #[prost(message, optional, tag = "3")]
            pub metadata: Option<ContainerMetadata>,
            #[prost(string, tag = "5")]
            pub image_ref: String,
            #[prost(enumeration = "ContainerState", tag = "6")]
            pub state: i32,
            #[prost(int64, tag = "7")]
            pub created_at: i64,
            #[prost(map = "string, string", tag = "8")]
            pub labels: HashMap<String, String>,
            #[prost(map = "string, string", tag = "9")]
            pub annotations: HashMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ListContainersResponse {
            #[prost(message, repeated, tag = "1")]
            pub containers: Vec<Container>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStatusRequest {
            #[prost(string, tag = "1")]
            pub container_id: String,
            #[prost(bool, tag = "2")]
            pub verbose: bool,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStatus {
            #[prost(string, tag = "1")]
            pub id: String,
            #[prost(message, optional, tag = "2")]
            pub metadata: Option<ContainerMetadata>,
            #[prost(enumeration = "ContainerState", tag = "3")]
            pub state: i32,
            #[prost(int64, tag = "4")]
            pub created_at: i64,
            #[prost(int64, tag = "5")]
            pub started_at: i64,
            #[prost(int64, tag = "6")]
            pub finished_at: i64,
            #[prost(int32, tag = "7")]
            pub exit_code: i32,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStatusResponse {
            #[prost(message, optional, tag = "1")]
            pub status: Option<ContainerStatus>,
            #[prost(map = "string, string", tag = "2")]
            pub info: HashMap<String, String>,
        }

        /// Unary client for `runtime.v1.RuntimeService`
        pub mod runtime_service_client {
            use super::*;
            use tonic::codegen::http::uri::PathAndQuery;
            use tonic::transport::Channel;

            #[derive(Debug, Clone)]
            pub struct RuntimeServiceClient {
                inner: tonic::client::Grpc<Channel>,
            }

            impl RuntimeServiceClient {
                pub fn new(channel: Channel) -> Self {
                    Self {
                        inner: tonic::client::Grpc::new(channel),
                    }
                }

                pub async fn list_pod_sandbox(
                    &mut self,
                    request: ListPodSandboxRequest,
                ) -> Result<ListPodSandboxResponse, tonic::Status> {
                    self.unary(request, "/runtime.v1.RuntimeService/ListPodSandbox")
                        .await
                }

                pub async fn list_containers(
                    &mut self,
                    request: ListContainersRequest,
                ) -> Result<ListContainersResponse, tonic::Status> {
                    self.unary(request, "/runtime.v1.RuntimeService/ListContainers")
                        .await
                }

                pub async fn container_status(
                    &mut self,
                    request: ContainerStatusRequest,
                ) -> Result<ContainerStatusResponse, tonic::Status> {
                    self.unary(request, "/runtime.v1.RuntimeService/ContainerStatus")
                        .await
                }

                async fn unary<Req, Resp>(
                    &mut self,
                    request: Req,
                    path: &'static str,
                ) -> Result<Resp, tonic::Status>
                where
                    Req: Message + Send + Sync + 'static,
                    Resp: Message + Default + Send + Sync + 'static,
                {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e),
                        )
                    })?;
                    let codec: tonic::codec::ProstCodec<Req, Resp> =
                        tonic::codec::ProstCodec::default();
                    let response = self
                        .inner
                        .unary(
                            tonic::Request::new(request),
                            PathAndQuery::from_static(path),
                            codec,
                        )
                        .await?;
                    Ok(response.into_inner())
                }
            }
        }
    }
}

pub use runtime::v1::*;

pub mod shared {
    pub mod bbox;
    pub mod config;
    pub mod constants;
    pub mod frame;
    pub mod identity;
    pub mod model_resolver;
    pub mod onnx_session;
}

pub mod capture {
    pub mod domain {
        pub mod camera_source;
    }
    pub mod infrastructure {
        pub mod image_sequence_source;
    }
    pub mod frame_buffer;
}

pub mod detection {
    pub mod domain {
        pub mod face_detector;
    }
    pub mod infrastructure;
}

pub mod recognition {
    pub mod domain {
        pub mod face_embedder;
        pub mod identity_store;
        pub mod unknown_face_pool;
    }
    pub mod infrastructure {
        pub mod onnx_arcface_embedder;
    }
}

pub mod tracking {
    pub mod assignment;
    pub mod face_tracker;
    pub mod motion_predictor;
    pub mod presence_verifier;
    pub mod track;
}

pub mod pipeline {
    pub mod infrastructure {
        pub mod detection_pool;
        pub mod recognition_pool;
        pub mod worker_pool;
    }
    pub mod enroll_gallery_use_case;
    pub mod pipeline_error;
    pub mod pipeline_logger;
    pub mod presence_pipeline;
    pub mod sinks;
}

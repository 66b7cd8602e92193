//! Programmatic descriptor fixtures for tests. No codegen: the descriptor
//! sets are assembled directly from prost-types.

use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};

fn field(name: &str, number: i32, kind: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(kind as i32),
        ..Default::default()
    }
}

fn message_field(name: &str, number: i32, type_name: &str, repeated: bool) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(if repeated { Label::Repeated } else { Label::Optional } as i32),
        r#type: Some(Type::Message as i32),
        type_name: Some(type_name.to_string()),
        ..Default::default()
    }
}

fn method(name: &str, input: &str, output: &str, server_streaming: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(input.to_string()),
        output_type: Some(output.to_string()),
        client_streaming: Some(false),
        server_streaming: Some(server_streaming),
        ..Default::default()
    }
}

pub fn user_service_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("user.proto".to_string()),
        package: Some("user.v1".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            DescriptorProto {
                name: Some("GetUserRequest".to_string()),
                field: vec![field("resource_id", 1, Type::String)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("User".to_string()),
                field: vec![
                    field("user_id", 1, Type::String),
                    field("name", 2, Type::String),
                    field("active", 3, Type::Bool),
                ],
                ..Default::default()
            },
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("UserService".to_string()),
            method: vec![
                method("GetUser", ".user.v1.GetUserRequest", ".user.v1.User", false),
                method("ListUsers", ".user.v1.GetUserRequest", ".user.v1.User", true),
            ],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn order_service_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("order.proto".to_string()),
        package: Some("order.v1".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![
            DescriptorProto {
                name: Some("CustomerInfo".to_string()),
                field: vec![field("id", 1, Type::String)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("OrderItem".to_string()),
                field: vec![field("sku", 1, Type::String), field("qty", 2, Type::Int32)],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("CreateOrderRequest".to_string()),
                field: vec![
                    message_field("customer_info", 1, ".order.v1.CustomerInfo", false),
                    message_field("order_items", 2, ".order.v1.OrderItem", true),
                ],
                ..Default::default()
            },
            DescriptorProto {
                name: Some("Order".to_string()),
                field: vec![
                    field("order_id", 1, Type::String),
                    message_field("customer_info", 2, ".order.v1.CustomerInfo", false),
                ],
                ..Default::default()
            },
        ],
        service: vec![ServiceDescriptorProto {
            name: Some("OrderService".to_string()),
            method: vec![method(
                "CreateOrder",
                ".order.v1.CreateOrderRequest",
                ".order.v1.Order",
                false,
            )],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn inventory_service_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("inventory.proto".to_string()),
        package: Some("inventory.v1".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![DescriptorProto {
            name: Some("Item".to_string()),
            field: vec![field("sku", 1, Type::String)],
            ..Default::default()
        }],
        service: vec![ServiceDescriptorProto {
            name: Some("InventoryService".to_string()),
            method: vec![method("GetItem", ".inventory.v1.Item", ".inventory.v1.Item", false)],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn user_service_descriptor_bytes() -> Vec<u8> {
    FileDescriptorSet { file: vec![user_service_file()] }.encode_to_vec()
}

pub fn order_service_descriptor_bytes() -> Vec<u8> {
    FileDescriptorSet { file: vec![order_service_file()] }.encode_to_vec()
}

pub fn combined_descriptor_bytes(names: &[&str]) -> Vec<u8> {
    let mut files = Vec::new();
    for name in names {
        match *name {
            "user" => files.push(user_service_file()),
            "order" => files.push(order_service_file()),
            "inventory" => files.push(inventory_service_file()),
            other => panic!("unknown fixture '{other}'"),
        }
    }
    FileDescriptorSet { file: files }.encode_to_vec()
}
